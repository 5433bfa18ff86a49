//! Byte-level links to a single physical instrument.
//!
//! A [`Transport`] owns exactly one link (serial port, TCP socket, or a simulated link)
//! and exposes raw writes plus framed reads bounded by a timeout. It also owns the
//! [`LinkState`] of that link through a [`LinkStateCell`]; the
//! [`CommandChannel`](crate::channel::CommandChannel) observes the state and drives
//! reconnects.
//!
//! # Link state machine
//!
//! ```text
//! disconnected ──open──▶ connecting ──ok──▶ connected ──I/O error──▶ faulted
//!       ▲                    │                  │                       │
//!       └──── open failed ───┘                  └──────── close ────────┤
//!                            ▲                                          │
//!                            └──────────────── reopen ──────────────────┘
//! ```

pub mod framing;
mod io;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod tcp;

pub use framing::{FrameBuffer, PrefixWidth, ResponseSpec, MAX_FRAME_LEN};
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use sim::{
    CannedResponder, EchoResponder, Responder, SimEvent, SimFault, SimulatedTransport,
    SimulationControl,
};
pub use tcp::TcpTransport;

use crate::config::ConfigError;
use crate::error::{AppResult, ControllerError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Connection state of one physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Not opened, or closed
    Disconnected,
    /// Open in progress
    Connecting,
    /// Ready for transactions
    Connected,
    /// Failed; must be reopened before use
    Faulted,
}

impl LinkState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Faulted)
                | (Faulted, Connecting)
                // close() releases the link from either live state
                | (Connected, Disconnected)
                | (Faulted, Disconnected)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Owner of a link's [`LinkState`], enforcing the permitted transitions.
///
/// Observers can [`subscribe`](LinkStateCell::subscribe) to state changes without
/// holding the device lock.
#[derive(Debug)]
pub struct LinkStateCell {
    label: String,
    tx: watch::Sender<LinkState>,
}

impl LinkStateCell {
    /// New cell in the `disconnected` state.
    pub fn new(label: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(LinkState::Disconnected);
        Self {
            label: label.into(),
            tx,
        }
    }

    /// Current state.
    pub fn get(&self) -> LinkState {
        *self.tx.borrow()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Re-entering the current state is a no-op.
    pub fn transition(&self, next: LinkState) -> AppResult<()> {
        let current = self.get();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            warn!(link = %self.label, from = %current, to = %next, "Rejected link state transition");
            return Err(ControllerError::Internal(format!(
                "invalid link state transition {} -> {} on {}",
                current, next, self.label
            )));
        }
        debug!(link = %self.label, from = %current, to = %next, "Link state transition");
        self.tx.send_replace(next);
        Ok(())
    }

    /// Mark a connected link as faulted; other states are left alone.
    pub fn fault(&self) {
        if self.get() == LinkState::Connected {
            let _ = self.transition(LinkState::Faulted);
        }
    }
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Serial flow control setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Line settings for a serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Path to the serial device (e.g., "/dev/ttyUSB0", "COM3")
    pub path: String,
    /// Line speed
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity bit
    pub parity: Parity,
    /// Flow control
    pub flow_control: FlowControl,
}

impl SerialSettings {
    /// 8N1 settings at the given baud rate.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Where the physical device lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    /// Local serial port
    Serial(SerialSettings),
    /// Raw TCP socket
    Tcp {
        /// Host name or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// In-process simulator
    Simulated {
        /// Label of the simulated link
        name: String,
    },
}

/// How to reach one physical device. Immutable once a controller has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Where the device lives
    pub endpoint: Endpoint,
    /// Read timeout applied to every framed read (and to TCP connects)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl ConnectionDescriptor {
    /// Default read timeout used when none is configured.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Descriptor for a simulated link.
    pub fn simulated(name: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Simulated { name: name.into() },
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Parse a device target as given on the command line.
    ///
    /// - `tcp://host:port` or `host:port` → TCP
    /// - `/dev/...`, `COMn` → serial, using `serial` for the line settings
    /// - bare `host` → TCP on `default_tcp_port` when the driver has one
    pub fn parse_target(
        target: &str,
        serial: &SerialSettings,
        default_tcp_port: Option<u16>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ControllerError::InvalidArgument(
                "device target is empty".to_string(),
            ));
        }

        let endpoint = if let Some(rest) = target.strip_prefix("tcp://") {
            parse_host_port(rest, default_tcp_port)?
        } else if looks_like_serial(target) {
            Endpoint::Serial(SerialSettings {
                path: target.to_string(),
                ..serial.clone()
            })
        } else {
            parse_host_port(target, default_tcp_port)?
        };

        Ok(Self { endpoint, timeout })
    }

    /// Short human-readable label for logs and error messages.
    pub fn label(&self) -> String {
        match &self.endpoint {
            Endpoint::Serial(s) => format!("serial:{}@{}", s.path, s.baud_rate),
            Endpoint::Tcp { host, port } => format!("tcp:{}:{}", host, port),
            Endpoint::Simulated { name } => format!("sim:{}", name),
        }
    }

    /// True for the simulated endpoint.
    pub fn is_simulated(&self) -> bool {
        matches!(self.endpoint, Endpoint::Simulated { .. })
    }
}

fn looks_like_serial(target: &str) -> bool {
    let upper = target.to_ascii_uppercase();
    target.starts_with('/')
        || (upper.len() > 3 && upper.starts_with("COM") && upper[3..].chars().all(|c| c.is_ascii_digit()))
}

fn parse_host_port(target: &str, default_port: Option<u16>) -> AppResult<Endpoint> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                ControllerError::InvalidArgument(format!("invalid TCP port in '{}'", target))
            })?;
            Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            })
        }
        Some(_) => Err(ControllerError::InvalidArgument(format!(
            "missing host in '{}'",
            target
        ))),
        None => match default_port {
            Some(port) => Ok(Endpoint::Tcp {
                host: target.to_string(),
                port,
            }),
            None => Err(ControllerError::InvalidArgument(format!(
                "'{}' is neither a serial device nor host:port",
                target
            ))),
        },
    }
}

/// Raw link to one physical instrument.
///
/// Implementations are driven by a single owner (`&mut self`), which is what makes a
/// transaction atomic: nothing else can write between a command and its response.
#[async_trait]
pub trait Transport: Send {
    /// The immutable descriptor this transport was built from.
    fn descriptor(&self) -> &ConnectionDescriptor;

    /// State cell of the link.
    fn link(&self) -> &LinkStateCell;

    /// Current link state.
    fn link_state(&self) -> LinkState {
        self.link().get()
    }

    /// Establish the link, dropping any previous handle first.
    ///
    /// Allowed from `disconnected` and `faulted`; a no-op when already connected.
    /// Fails with [`ControllerError::LinkUnavailable`].
    async fn open(&mut self) -> AppResult<()>;

    /// Release the link. Idempotent.
    async fn close(&mut self) -> AppResult<()>;

    /// Write all bytes. Fails with `LinkTimeout` or `LinkBroken`.
    async fn write(&mut self, data: &[u8]) -> AppResult<()>;

    /// Read one frame shaped by `spec` within `timeout`.
    async fn read_frame(&mut self, spec: &ResponseSpec, timeout: Duration) -> AppResult<Bytes>;

    /// Drop any stale input, both buffered and pending on the link.
    async fn discard_input(&mut self) -> AppResult<()>;

    /// Mark the link faulted after a failure observed above the transport.
    fn mark_faulted(&mut self) {
        self.link().fault();
    }
}

/// Build the live transport for `descriptor`.
///
/// Simulated endpoints need a [`Responder`] and are built with
/// [`SimulatedTransport::new`] instead.
pub fn live_transport(descriptor: &ConnectionDescriptor) -> AppResult<Box<dyn Transport>> {
    match &descriptor.endpoint {
        Endpoint::Tcp { .. } => Ok(Box::new(TcpTransport::new(descriptor.clone())?)),
        #[cfg(feature = "serial")]
        Endpoint::Serial(_) => Ok(Box::new(SerialTransport::new(descriptor.clone())?)),
        #[cfg(not(feature = "serial"))]
        Endpoint::Serial(_) => Err(ConfigError::ValidationError(
            "Serial support not enabled. Rebuild with --features serial".to_string(),
        )
        .into()),
        Endpoint::Simulated { .. } => Err(ConfigError::ValidationError(
            "simulated endpoints are built by the controller host".to_string(),
        )
        .into()),
    }
}
