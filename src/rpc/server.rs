//! TCP accept loop for the JSON-lines protocol.

use super::{RpcRequest, RpcResponse, MAX_LINE_LEN};
use crate::error::{AppResult, ControllerError};
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Answers decoded requests.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Answer one request; failures become error records.
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

/// Listener plus the stop signal of every connection it accepted.
pub struct RpcServer {
    listener: TcpListener,
    stop_tx: watch::Sender<bool>,
}

impl RpcServer {
    /// Bind to `addr` (`host:port`).
    pub async fn bind(addr: &str) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ControllerError::Internal(format!("failed to bind RPC listener on {}: {}", addr, e))
        })?;
        Ok(Self::from_listener(listener))
    }

    /// Serve on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { listener, stop_tx }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep being served until [`stop`](Self::stop), so
    /// callers that are mid-request still get their reply.
    pub async fn run<F>(&self, handler: Arc<dyn RpcHandler>, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        info!(addr = ?self.listener.local_addr().ok(), "RPC server listening");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("RPC server no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "RPC client connected");
                        let handler = handler.clone();
                        let stop_rx = self.stop_tx.subscribe();
                        tokio::spawn(async move {
                            match serve_connection(stream, handler, stop_rx).await {
                                Ok(()) => debug!(%peer, "RPC client disconnected"),
                                Err(e) => warn!(%peer, error = %e, "RPC connection closed with error"),
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "RPC accept failed"),
                },
            }
        }
    }

    /// Close every connection once it is between requests.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    mut stop_rx: watch::Receiver<bool>,
) -> AppResult<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        if *stop_rx.borrow() {
            return Ok(());
        }
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64 + 1);
        let read = tokio::select! {
            read = limited.read_until(b'\n', &mut line) => read?,
            _ = stop_rx.changed() => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }
        if line.len() > MAX_LINE_LEN {
            let err = ControllerError::InvalidRequest(format!(
                "request exceeds {} bytes",
                MAX_LINE_LEN
            ));
            write_response(&mut writer, &RpcResponse::failed(0, &err)).await?;
            return Err(err);
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let response = match serde_json::from_slice::<RpcRequest>(&line) {
            Ok(request) => handler.handle(request).await,
            Err(e) => {
                debug!(error = %e, "Malformed RPC request");
                RpcResponse::failed(0, &ControllerError::from(e))
            }
        };
        write_response(&mut writer, &response).await?;
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &RpcResponse,
) -> AppResult<()> {
    let mut bytes = serde_json::to_vec(response)
        .map_err(|e| ControllerError::Internal(format!("unserializable response: {}", e)))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::AsyncBufReadExt;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            RpcResponse::ok(request.id, json!(request.method))
        }
    }

    async fn start() -> (Arc<RpcServer>, SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Arc::new(RpcServer::from_listener(listener));
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let runner = server.clone();
        tokio::spawn(async move {
            runner
                .run(Arc::new(Echo), async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        });
        (server, addr, shutdown_tx)
    }

    async fn exchange(
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        line: &str,
    ) -> Value {
        writer.write_all(line.as_bytes()).await.unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let (_server, addr, _shutdown) = start().await;
        let (r, mut w) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut r = BufReader::new(r);

        let first = exchange(&mut r, &mut w, "{\"id\":1,\"method\":\"a\"}\n").await;
        let second = exchange(&mut r, &mut w, "{\"id\":2,\"method\":\"b\"}\n").await;
        assert_eq!(first, json!({"id": 1, "status": "ok", "ret": "a"}));
        assert_eq!(second["id"], 2);
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let (_server, addr, _shutdown) = start().await;
        let (r, mut w) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut r = BufReader::new(r);

        let bad = exchange(&mut r, &mut w, "not json\n").await;
        assert_eq!(bad["status"], "failed");
        assert_eq!(bad["error"]["kind"], "InvalidRequest");

        let good = exchange(&mut r, &mut w, "{\"id\":9,\"method\":\"x\"}\n").await;
        assert_eq!(good["id"], 9);
    }

    #[tokio::test]
    async fn test_stop_closes_idle_connections() {
        let (server, addr, shutdown) = start().await;
        let (r, _w) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut r = BufReader::new(r);
        // let the server register the connection
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        shutdown.send_replace(true);
        server.stop();

        let mut reply = String::new();
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), r.read_line(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
