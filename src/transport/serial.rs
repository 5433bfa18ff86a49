//! RS-232 / USB-serial links via `tokio-serial`.

use super::framing::{FrameBuffer, ResponseSpec};
use super::{io, ConnectionDescriptor, Endpoint, FlowControl, LinkState, LinkStateCell, Parity};
use super::{SerialSettings, Transport};
use crate::config::ConfigError;
use crate::error::{AppResult, ControllerError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Transport over a serial port.
pub struct SerialTransport {
    descriptor: ConnectionDescriptor,
    settings: SerialSettings,
    port: Option<SerialStream>,
    buffer: FrameBuffer,
    link: LinkStateCell,
}

impl SerialTransport {
    /// Build an unopened transport for a serial descriptor.
    ///
    /// # Errors
    /// Returns a configuration error when the descriptor is not a serial endpoint or
    /// the line settings are out of range.
    pub fn new(descriptor: ConnectionDescriptor) -> AppResult<Self> {
        let settings = match &descriptor.endpoint {
            Endpoint::Serial(settings) => settings.clone(),
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "serial transport cannot serve endpoint {:?}",
                    other
                ))
                .into())
            }
        };
        data_bits(settings.data_bits)?;
        stop_bits(settings.stop_bits)?;

        let link = LinkStateCell::new(descriptor.label());
        Ok(Self {
            descriptor,
            settings,
            port: None,
            buffer: FrameBuffer::new(),
            link,
        })
    }

    fn open_port(&self) -> AppResult<SerialStream> {
        let s = &self.settings;
        let parity = match s.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let flow_control = match s.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        tokio_serial::new(&s.path, s.baud_rate)
            .data_bits(data_bits(s.data_bits)?)
            .parity(parity)
            .stop_bits(stop_bits(s.stop_bits)?)
            .flow_control(flow_control)
            .timeout(self.descriptor.timeout)
            .open_native_async()
            .map_err(|e| ControllerError::LinkUnavailable {
                target: self.descriptor.label(),
                reason: e.to_string(),
            })
    }

    fn fail(&mut self, err: ControllerError) -> ControllerError {
        if err.is_link_transient() {
            self.link.fault();
        }
        err
    }

    fn not_connected(&self) -> ControllerError {
        ControllerError::LinkBroken(format!("{} is not connected", self.descriptor.label()))
    }
}

fn data_bits(bits: u8) -> AppResult<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(ConfigError::ValidationError(format!(
            "data_bits must be 5-8, got {}",
            other
        ))
        .into()),
    }
}

fn stop_bits(bits: u8) -> AppResult<tokio_serial::StopBits> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(ConfigError::ValidationError(format!(
            "stop_bits must be 1 or 2, got {}",
            other
        ))
        .into()),
    }
}

#[async_trait]
impl Transport for SerialTransport {
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
        // the OS handle must be released before the path can be reopened
        self.port = None;
        self.buffer.clear();

        match self.open_port() {
            Ok(port) => {
                self.port = Some(port);
                self.link.transition(LinkState::Connected)?;
                info!(
                    link = %self.descriptor.label(),
                    baud = self.settings.baud_rate,
                    "Serial link open"
                );
                Ok(())
            }
            Err(e) => {
                self.link.transition(LinkState::Disconnected)?;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.port.take().is_some() {
            debug!(link = %self.descriptor.label(), "Serial link closed");
        }
        self.buffer.clear();
        self.link.transition(LinkState::Disconnected)
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        let limit = self.descriptor.timeout;
        let Some(port) = self.port.as_mut() else {
            return Err(self.not_connected());
        };
        let result = io::write_all(port, data, limit).await;
        result.map_err(|e| self.fail(e))
    }

    async fn read_frame(&mut self, spec: &ResponseSpec, timeout: Duration) -> AppResult<Bytes> {
        let Some(port) = self.port.as_mut() else {
            return Err(self.not_connected());
        };
        let result = io::read_frame(port, &mut self.buffer, spec, timeout).await;
        result.map_err(|e| self.fail(e))
    }

    async fn discard_input(&mut self) -> AppResult<()> {
        self.buffer.clear();
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear(ClearBuffer::Input) {
                warn!(link = %self.descriptor.label(), error = %e, "Failed to clear serial input buffer");
            }
            io::drain(port, &mut self.buffer).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_line_settings() {
        let mut settings = SerialSettings::new("/dev/ttyUSB0", 19200);
        settings.data_bits = 9;
        let desc = ConnectionDescriptor {
            endpoint: Endpoint::Serial(settings),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            SerialTransport::new(desc),
            Err(ControllerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_port_is_link_unavailable() {
        let desc = ConnectionDescriptor {
            endpoint: Endpoint::Serial(SerialSettings::new("/dev/does-not-exist-42", 19200)),
            timeout: Duration::from_millis(100),
        };
        let mut transport = SerialTransport::new(desc).unwrap();
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, ControllerError::LinkUnavailable { .. }));
        assert_eq!(transport.link_state(), LinkState::Disconnected);
    }
}
