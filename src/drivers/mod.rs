//! Instrument drivers.
//!
//! Each driver turns typed operations into command transactions for one instrument
//! family and parses the replies. Drivers never touch the link directly: every
//! operation runs through [`Device::run`](crate::device::Device::run), so concurrent
//! callers are serialized by the device lock.
//!
//! Drivers implement the category traits that fit their instrument ([`Identify`],
//! [`VoltageSource`], [`FrequencySource`]) and publish their methods through
//! [`RpcTarget`](crate::rpc::RpcTarget).

pub mod scpi;
pub mod scpi_synth;
pub mod tti_ql355;

pub use scpi::{ScpiDevice, ScpiSimulator, SystemError};
pub use scpi_synth::{ScpiSynth, SynthSimulator};
pub use tti_ql355::{PsuModel, Ql355, Ql355Simulator};

use crate::channel::CommandChannel;
use crate::error::{AppResult, ControllerError};
use crate::rpc::RpcTarget;
use crate::transport::Responder;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Instruments that report an identity.
#[async_trait]
pub trait Identify: Send + Sync {
    /// Raw `*IDN?` response.
    async fn identity(&self) -> AppResult<String>;

    /// True when the connected instrument is the expected kind.
    async fn ping(&self) -> AppResult<bool>;
}

/// Programmable DC supplies. Channels are 0-based.
#[async_trait]
pub trait VoltageSource: Identify {
    /// Set the voltage limit of `channel`.
    async fn set_voltage_limit(&self, channel: usize, volts: f64) -> AppResult<()>;
    /// Configured voltage limit of `channel`.
    async fn voltage_limit(&self, channel: usize) -> AppResult<f64>;
    /// Set the current limit of `channel`.
    async fn set_current_limit(&self, channel: usize, amps: f64) -> AppResult<()>;
    /// Configured current limit of `channel`.
    async fn current_limit(&self, channel: usize) -> AppResult<f64>;
    /// Measured output voltage
    async fn measured_voltage(&self, channel: usize) -> AppResult<f64>;
    /// Measured output current
    async fn measured_current(&self, channel: usize) -> AppResult<f64>;
    /// Switch the output of `channel`.
    async fn set_output_enable(&self, channel: usize, enable: bool) -> AppResult<()>;
}

/// RF signal generators.
#[async_trait]
pub trait FrequencySource: Identify {
    /// Set the carrier frequency in Hz.
    async fn set_frequency(&self, hz: f64) -> AppResult<()>;
    /// Carrier frequency in Hz.
    async fn frequency(&self) -> AppResult<f64>;
    /// Set the output power in dBm.
    async fn set_power(&self, dbm: f64) -> AppResult<()>;
    /// Output power in dBm.
    async fn power(&self) -> AppResult<f64>;
    /// Switch the RF output.
    async fn set_rf_enable(&self, enable: bool) -> AppResult<()>;
    /// Whether the RF output is on.
    async fn rf_enabled(&self) -> AppResult<bool>;
}

/// Construction-time settings shared by every driver.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Device name used in logs and lock diagnostics
    pub name: String,
    /// Longest a call waits for the device
    pub lock_timeout: Duration,
    /// Expected serial number (third `*IDN?` field), if it should be checked
    pub serial_number: Option<String>,
}

impl DriverOptions {
    /// Defaults for the device called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock_timeout: Duration::from_secs(10),
            serial_number: None,
        }
    }
}

/// Supported instrument families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum DriverKind {
    /// Generic IEEE-488.2 / SCPI instrument
    Scpi,
    /// TTI QL355P / QL355TP power supply
    Ql355,
    /// SCPI RF synthesizer
    Synth,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

impl DriverKind {
    /// Target name the driver is published under.
    pub fn service_name(self) -> &'static str {
        match self {
            DriverKind::Scpi => "scpi",
            DriverKind::Ql355 => "ql355",
            DriverKind::Synth => "synth",
        }
    }

    /// Well-known RPC port of the controller.
    pub fn default_rpc_port(self) -> u16 {
        match self {
            DriverKind::Scpi => 4301,
            DriverKind::Ql355 => 4006,
            DriverKind::Synth => 4300,
        }
    }

    /// Instrument port used when the target is a bare host name.
    pub fn default_device_port(self) -> Option<u16> {
        match self {
            DriverKind::Scpi | DriverKind::Synth => Some(5025),
            DriverKind::Ql355 => Some(9221),
        }
    }

    /// Baud rate used when the target is a serial port.
    pub fn default_baud(self) -> u32 {
        match self {
            DriverKind::Ql355 => 19200,
            DriverKind::Scpi | DriverKind::Synth => 9600,
        }
    }

    /// Emulator answering in this driver's dialect.
    pub fn simulator(self) -> Box<dyn Responder> {
        match self {
            DriverKind::Scpi => Box::new(ScpiSimulator::new()),
            DriverKind::Ql355 => Box::new(Ql355Simulator::new(PsuModel::Ql355Tp)),
            DriverKind::Synth => Box::new(SynthSimulator::new()),
        }
    }

    /// Connect the driver over `channel` and run its startup checks.
    ///
    /// # Errors
    /// `LinkUnavailable` if the device can't be reached, or the driver's own startup
    /// failure (wrong instrument, serial number mismatch).
    pub async fn build(
        self,
        channel: CommandChannel,
        options: &DriverOptions,
    ) -> AppResult<Arc<dyn RpcTarget>> {
        let target: Arc<dyn RpcTarget> = match self {
            DriverKind::Scpi => Arc::new(ScpiDevice::connect(channel, options).await?),
            DriverKind::Ql355 => Arc::new(Ql355::connect(channel, options).await?),
            DriverKind::Synth => Arc::new(ScpiSynth::connect(channel, options).await?),
        };
        Ok(target)
    }
}

/// Split an `*IDN?` response into trimmed fields.
pub fn idn_fields(idn: &str) -> Vec<String> {
    idn.split(',').map(|f| f.trim().to_string()).collect()
}

/// Parse a numeric reply, optionally followed by a unit suffix (`"12.003V"`).
pub(crate) fn parse_number(reply: &str, what: &str) -> AppResult<f64> {
    let trimmed = reply.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic());
    trimmed.trim().parse::<f64>().map_err(|_| {
        ControllerError::Protocol(format!("expected {} but device sent '{}'", what, reply))
    })
}

/// Parse a `0`/`1` reply.
pub(crate) fn parse_flag(reply: &str, what: &str) -> AppResult<bool> {
    match reply.trim() {
        "0" | "OFF" => Ok(false),
        "1" | "ON" => Ok(true),
        other => Err(ControllerError::Protocol(format!(
            "expected {} flag but device sent '{}'",
            what, other
        ))),
    }
}

/// Reject values outside `min..=max` (and NaN).
pub(crate) fn check_range(quantity: &str, value: f64, min: f64, max: f64) -> AppResult<()> {
    if value.is_nan() || value < min || value > max {
        return Err(ControllerError::out_of_range(quantity, value, min, max));
    }
    Ok(())
}

/// Trimmed text of a simulated command, with its terminator removed.
pub(crate) fn sim_command(command: &[u8]) -> String {
    String::from_utf8_lossy(command)
        .trim_end_matches(['\r', '\n'])
        .trim()
        .to_string()
}

/// Simulated reply text with the line terminator appended.
pub(crate) fn sim_reply(text: impl fmt::Display) -> Option<Vec<u8>> {
    Some(format!("{}\n", text).into_bytes())
}
