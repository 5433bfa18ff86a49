//! Client side of the JSON-lines protocol.

use super::{CallArgs, RpcRequest, RpcResponse, LIST_METHODS, MAX_LINE_LEN, PING, TARGETS};
use crate::error::{AppResult, ControllerError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection to one controller. Calls are issued one at a time.
pub struct RpcClient {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Bytes of a reply line read so far; survives a timed-out read.
    line: Vec<u8>,
    next_id: u64,
    target: Option<String>,
    timeout: Duration,
}

impl RpcClient {
    /// Reply timeout unless [`with_timeout`](Self::with_timeout) is used.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connect to a controller at `addr` (`host:port`).
    ///
    /// # Errors
    /// `LinkUnavailable` if nothing is listening.
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ControllerError::LinkUnavailable {
                target: addr.to_string(),
                reason: e.to_string(),
            })?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            reader: BufReader::new(read_half),
            writer,
            line: Vec::new(),
            next_id: 1,
            target: None,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// Address calls to a named target instead of the controller's default.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Fail calls whose reply takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invoke `method` with positional arguments.
    pub async fn call(&mut self, method: &str, args: Vec<Value>) -> AppResult<Value> {
        self.call_with(method, CallArgs::positional(args)).await
    }

    /// Invoke `method` and wait for its reply.
    ///
    /// # Errors
    /// [`ControllerError::Remote`] carrying the remote error kind, or a link error if
    /// the connection fails.
    pub async fn call_with(&mut self, method: &str, args: CallArgs) -> AppResult<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = RpcRequest::new(id, method, args);
        request.target = self.target.clone();

        let mut bytes = serde_json::to_vec(&request)
            .map_err(|e| ControllerError::Internal(format!("unserializable request: {}", e)))?;
        bytes.push(b'\n');
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| ControllerError::LinkBroken(e.to_string()))?;
        debug!(addr = %self.addr, id, method, "RPC request sent");

        let limit = self.timeout;
        let response = tokio::time::timeout(limit, self.reply_to(id))
            .await
            .map_err(|_| ControllerError::LinkTimeout(limit))??;
        response.into_result()
    }

    /// Like [`call`](Self::call), decoding the return value.
    pub async fn call_typed<T: DeserializeOwned>(
        &mut self,
        method: &str,
        args: Vec<Value>,
    ) -> AppResult<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| ControllerError::Protocol(format!("unexpected return value: {}", e)))
    }

    /// Round trip to the controller.
    pub async fn ping(&mut self) -> AppResult<()> {
        self.call(PING, Vec::new()).await.map(|_| ())
    }

    /// Names of the published targets.
    pub async fn targets(&mut self) -> AppResult<Vec<String>> {
        self.call_typed(TARGETS, Vec::new()).await
    }

    /// Method descriptions of the current target.
    pub async fn list_methods(&mut self) -> AppResult<Value> {
        self.call(LIST_METHODS, Vec::new()).await
    }

    /// Read until the reply to `id` arrives.
    ///
    /// Replies to earlier requests that timed out are discarded. Id 0 is the server's
    /// answer to a request it could not decode, which can only be the latest one.
    async fn reply_to(&mut self, id: u64) -> AppResult<RpcResponse> {
        loop {
            let response = self.read_response().await?;
            if response.id == id || response.id == 0 {
                return Ok(response);
            }
            if response.id < id {
                debug!(addr = %self.addr, stale = response.id, id, "Discarding late RPC reply");
                continue;
            }
            return Err(ControllerError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id, id
            )));
        }
    }

    async fn read_response(&mut self) -> AppResult<RpcResponse> {
        let budget = (MAX_LINE_LEN + 1).saturating_sub(self.line.len()) as u64;
        let read = (&mut self.reader)
            .take(budget)
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|e| ControllerError::LinkBroken(e.to_string()))?;
        if self.line.len() > MAX_LINE_LEN {
            self.line.clear();
            return Err(ControllerError::Protocol(format!(
                "response exceeds {} bytes",
                MAX_LINE_LEN
            )));
        }
        if read == 0 {
            return Err(ControllerError::LinkBroken(format!(
                "controller at {} closed the connection",
                self.addr
            )));
        }
        let line = std::mem::take(&mut self.line);
        serde_json::from_slice(&line)
            .map_err(|e| ControllerError::Protocol(format!("malformed response: {}", e)))
    }
}
