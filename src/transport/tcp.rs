//! SCPI-over-TCP (and other socket) links.

use super::framing::{FrameBuffer, ResponseSpec};
use super::{io, ConnectionDescriptor, Endpoint, LinkState, LinkStateCell, Transport};
use crate::config::ConfigError;
use crate::error::{AppResult, ControllerError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Transport over a TCP socket.
pub struct TcpTransport {
    descriptor: ConnectionDescriptor,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    buffer: FrameBuffer,
    link: LinkStateCell,
}

impl TcpTransport {
    /// Build an unopened transport for a TCP descriptor.
    pub fn new(descriptor: ConnectionDescriptor) -> AppResult<Self> {
        let (host, port) = match &descriptor.endpoint {
            Endpoint::Tcp { host, port } => (host.clone(), *port),
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "TCP transport cannot serve endpoint {:?}",
                    other
                ))
                .into())
            }
        };
        let link = LinkStateCell::new(descriptor.label());
        Ok(Self {
            descriptor,
            host,
            port,
            stream: None,
            buffer: FrameBuffer::new(),
            link,
        })
    }

    fn fail(&mut self, err: ControllerError) -> ControllerError {
        if err.is_link_transient() {
            self.link.fault();
        }
        err
    }

    fn stream(&mut self) -> AppResult<&mut TcpStream> {
        match self.stream.as_mut() {
            Some(stream) if self.link.get() == LinkState::Connected => Ok(stream),
            _ => Err(ControllerError::LinkBroken(format!(
                "{} is not connected",
                self.descriptor.label()
            ))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn link(&self) -> &LinkStateCell {
        &self.link
    }

    async fn open(&mut self) -> AppResult<()> {
        if self.link.get() == LinkState::Connected {
            return Ok(());
        }
        self.link.transition(LinkState::Connecting)?;
        self.stream = None;
        self.buffer.clear();

        let limit = self.descriptor.timeout;
        let addr = format!("{}:{}", self.host, self.port);
        let reason = match tokio::time::timeout(limit, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(link = %self.descriptor.label(), error = %e, "Could not set TCP_NODELAY");
                }
                self.stream = Some(stream);
                self.link.transition(LinkState::Connected)?;
                info!(link = %self.descriptor.label(), "TCP link open");
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {:?}", limit),
        };

        self.link.transition(LinkState::Disconnected)?;
        Err(ControllerError::LinkUnavailable {
            target: self.descriptor.label(),
            reason,
        })
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.stream.take().is_some() {
            debug!(link = %self.descriptor.label(), "TCP link closed");
        }
        self.buffer.clear();
        self.link.transition(LinkState::Disconnected)
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        let limit = self.descriptor.timeout;
        let stream = self.stream()?;
        let result = io::write_all(stream, data, limit).await;
        result.map_err(|e| self.fail(e))
    }

    async fn read_frame(&mut self, spec: &ResponseSpec, timeout: Duration) -> AppResult<Bytes> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ControllerError::LinkBroken(format!(
                "{} is not connected",
                self.descriptor.label()
            )));
        };
        let result = io::read_frame(stream, &mut self.buffer, spec, timeout).await;
        result.map_err(|e| self.fail(e))
    }

    async fn discard_input(&mut self) -> AppResult<()> {
        self.buffer.clear();
        if let Some(stream) = self.stream.as_mut() {
            let dropped = io::drain(stream, &mut self.buffer).await?;
            if dropped > 0 {
                debug!(link = %self.descriptor.label(), dropped, "Discarded stale input");
            }
        }
        Ok(())
    }
}
