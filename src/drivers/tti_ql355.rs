//! TTI QL355P (single channel) and QL355TP (two channels + aux) power supplies.
//!
//! Channels are numbered from 0 on the API and from 1 on the wire. On the QL355TP
//! channels 0 and 1 are programmable; the aux output (channel 2) can only be switched
//! on and off. The driver does not select the output range.
//!
//! Default TCP/IP port is 9221, serial links run at 19200 baud.

use super::{
    check_range, idn_fields, parse_flag, parse_number, sim_command, sim_reply, DriverOptions,
    Identify, VoltageSource,
};
use crate::channel::{CommandChannel, Transaction};
use crate::device::{CachedState, Device, Session};
use crate::error::{AppResult, ControllerError};
use crate::rpc::{ret, CallArgs, MethodInfo, RpcTarget};
use crate::transport::Responder;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Highest programmable voltage (V)
pub const MAX_VOLTAGE: f64 = 35.0;
/// Highest programmable current (A)
pub const MAX_CURRENT: f64 = 5.0;

const MANUFACTURERS: [&str; 2] = ["THURLBY-THANDAR", "THURLBY THANDAR"];

// limit status register bits that mean the output has been shut off
const LSR_OVP_TRIP: u32 = 1 << 2;
const LSR_OCP_TRIP: u32 = 1 << 3;
const LSR_HW_TRIP: u32 = 1 << 6;

/// Supply model, detected from `*IDN?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PsuModel {
    /// Single output
    #[serde(rename = "QL355P")]
    Ql355P,
    /// Triple output
    #[serde(rename = "QL355TP")]
    Ql355Tp,
}

impl fmt::Display for PsuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsuModel::Ql355P => f.write_str("QL355P"),
            PsuModel::Ql355Tp => f.write_str("QL355TP"),
        }
    }
}

impl PsuModel {
    /// Detect the model from an identity string.
    pub fn from_idn(idn: &str) -> AppResult<Self> {
        let fields = idn_fields(idn);
        if !fields
            .first()
            .is_some_and(|m| MANUFACTURERS.contains(&m.as_str()))
        {
            return Err(ControllerError::Protocol(format!(
                "not a TTI supply: '{}'",
                idn
            )));
        }
        match fields.get(1).map(String::as_str) {
            Some("QL355P") => Ok(PsuModel::Ql355P),
            Some("QL355TP") => Ok(PsuModel::Ql355Tp),
            _ => Err(ControllerError::Protocol(format!(
                "unsupported PSU type '{}'",
                idn
            ))),
        }
    }

    /// Highest valid channel for programming, or for output switching when `enable`.
    fn max_channel(self, enable: bool) -> usize {
        match (self, enable) {
            (PsuModel::Ql355P, _) => 0,
            (PsuModel::Ql355Tp, false) => 1,
            (PsuModel::Ql355Tp, true) => 2,
        }
    }

    fn check_channel(self, channel: usize, enable: bool) -> AppResult<()> {
        let max = self.max_channel(enable);
        if channel > max {
            return Err(ControllerError::out_of_range(
                format!("{} channel", self),
                channel as f64,
                0.0,
                max as f64,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Ql355State {
    model: Option<PsuModel>,
}

impl CachedState for Ql355State {
    fn invalidate(&mut self) {
        self.model = None;
    }
}

/// Model of the connected supply, re-detected after a reconnect.
async fn model(s: &mut Session<Ql355State>) -> AppResult<PsuModel> {
    if let Some(model) = s.state.model {
        return Ok(model);
    }
    let model = PsuModel::from_idn(&s.query("*IDN?").await?)?;
    debug!(%model, "Detected PSU model");
    s.state.model = Some(model);
    Ok(model)
}

/// Query a programmed limit; the reply echoes the header (`V1 12.000`).
async fn query_echoed(s: &mut Session<Ql355State>, header: &str) -> AppResult<f64> {
    let reply = s.query(&format!("{}?", header)).await?;
    let mut parts = reply.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(h), Some(value)) if h == header => parse_number(value, header),
        _ => Err(ControllerError::Protocol(format!(
            "device responded incorrectly to {}?: '{}'",
            header, reply
        ))),
    }
}

/// Driver for QL355P / QL355TP supplies.
pub struct Ql355 {
    device: Device<Ql355State>,
}

const METHODS: &[MethodInfo] = &[
    MethodInfo::new("identity", "()", "Device identity string"),
    MethodInfo::new("ping", "()", "True if connected to a QL355P/QL355TP"),
    MethodInfo::new("model", "()", "Detected model (QL355P or QL355TP)"),
    MethodInfo::new("set_voltage_limit", "(volts, channel=0)", "Set the voltage limit in volts"),
    MethodInfo::new("get_voltage_limit", "(channel=0)", "Voltage limit in volts"),
    MethodInfo::new("set_current_limit", "(amps, channel=0)", "Set the current limit in amps"),
    MethodInfo::new("get_current_limit", "(channel=0)", "Current limit in amps"),
    MethodInfo::new("get_voltage", "(channel=0)", "Measured output voltage in volts"),
    MethodInfo::new("get_current", "(channel=0)", "Measured output current in amps"),
    MethodInfo::new("set_output_enable", "(enable, channel=0)", "Enable / disable a channel"),
    MethodInfo::new("get_output_enable", "(channel=0)", "True if the channel output is on"),
    MethodInfo::new("set_voltage_step", "(volts, channel=0)", "Step size used by increment_voltage"),
    MethodInfo::new("increment_voltage", "(channel=0)", "Raise the voltage limit by one step; never repeated"),
    MethodInfo::new("check_trip", "(channel=0)", "Fail with InterlockTripped if the channel has tripped"),
    MethodInfo::new("reset_trip", "()", "Clear latched trip conditions"),
];

impl Ql355 {
    /// Purge stale input, verify the instrument and detect its model.
    pub async fn connect(channel: CommandChannel, options: &DriverOptions) -> AppResult<Self> {
        let device = Device::new(
            options.name.clone(),
            channel,
            Ql355State::default(),
            options.lock_timeout,
        );
        device.connect().await?;
        let driver = Self { device };

        driver.purge().await?;
        if !driver.ping().await? {
            return Err(ControllerError::Protocol(
                "connected device is not a QL355P/QL355TP".to_string(),
            ));
        }
        let model = driver.model().await?;
        info!(device = %options.name, %model, "QL355 ready");
        Ok(driver)
    }

    /// Start from a clean slate: a bare carriage return clears the supply's input
    /// buffer, then anything it had queued for us is dropped.
    pub async fn purge(&self) -> AppResult<()> {
        self.device
            .run("purge", |s| {
                async move {
                    s.transact(&Transaction::write_only(&b"\r"[..])).await?;
                    s.purge().await
                }
                .boxed()
            })
            .await
    }

    /// Model detected at connect.
    pub async fn model(&self) -> AppResult<PsuModel> {
        self.device.run("model", |s| model(s).boxed()).await
    }

    /// Whether the output of `channel` is on.
    pub async fn output_enabled(&self, channel: usize) -> AppResult<bool> {
        self.device
            .run("get_output_enable", move |s| {
                async move {
                    model(s).await?.check_channel(channel, true)?;
                    let reply = s.query(&format!("OP{}?", channel + 1)).await?;
                    parse_flag(&reply, "output state")
                }
                .boxed()
            })
            .await
    }

    /// Step size for [`increment_voltage`](Self::increment_voltage).
    pub async fn set_voltage_step(&self, channel: usize, volts: f64) -> AppResult<()> {
        check_range("voltage step", volts, 0.0, MAX_VOLTAGE)?;
        self.device
            .run("set_voltage_step", move |s| {
                async move {
                    model(s).await?.check_channel(channel, false)?;
                    s.send(&format!("DELTAV{} {}", channel + 1, volts)).await
                }
                .boxed()
            })
            .await
    }

    /// Raise the voltage limit by one step. Relative, so never resent.
    pub async fn increment_voltage(&self, channel: usize) -> AppResult<()> {
        self.device
            .run("increment_voltage", move |s| {
                async move {
                    model(s).await?.check_channel(channel, false)?;
                    s.send_once(&format!("INCV{}", channel + 1)).await
                }
                .boxed()
            })
            .await
    }

    /// Fail with `InterlockTripped` if the channel's protection has shut it off.
    pub async fn check_trip(&self, channel: usize) -> AppResult<()> {
        let name = self.device.name().to_string();
        self.device
            .run("check_trip", move |s| {
                async move {
                    model(s).await?.check_channel(channel, false)?;
                    let reply = s.query(&format!("LSR{}?", channel + 1)).await?;
                    let status = reply.trim().parse::<u32>().map_err(|_| {
                        ControllerError::Protocol(format!("malformed limit status '{}'", reply))
                    })?;
                    let cause = if status & LSR_OVP_TRIP != 0 {
                        Some("over-voltage protection")
                    } else if status & LSR_OCP_TRIP != 0 {
                        Some("over-current protection")
                    } else if status & LSR_HW_TRIP != 0 {
                        Some("hardware protection")
                    } else {
                        None
                    };
                    match cause {
                        Some(cause) => {
                            warn!(device = %name, channel, status, "PSU output tripped");
                            Err(ControllerError::InterlockTripped(format!(
                                "channel {}: {} tripped",
                                channel, cause
                            )))
                        }
                        None => Ok(()),
                    }
                }
                .boxed()
            })
            .await
    }

    /// Clear a tripped protection (`TRIPRST`).
    pub async fn reset_trip(&self) -> AppResult<()> {
        self.device
            .run("reset_trip", |s| s.send("TRIPRST").boxed())
            .await
    }

    async fn set_limit(&self, op: &str, letter: char, channel: usize, value: f64) -> AppResult<()> {
        self.device
            .run(op, move |s| {
                async move {
                    model(s).await?.check_channel(channel, false)?;
                    s.send(&format!("{}{} {}", letter, channel + 1, value)).await
                }
                .boxed()
            })
            .await
    }

    async fn get_limit(&self, op: &str, letter: char, channel: usize) -> AppResult<f64> {
        self.device
            .run(op, move |s| {
                async move {
                    model(s).await?.check_channel(channel, false)?;
                    query_echoed(s, &format!("{}{}", letter, channel + 1)).await
                }
                .boxed()
            })
            .await
    }

    async fn measure(&self, op: &str, letter: char, channel: usize) -> AppResult<f64> {
        self.device
            .run(op, move |s| {
                async move {
                    model(s).await?.check_channel(channel, false)?;
                    let reply = s.query(&format!("{}{}O?", letter, channel + 1)).await?;
                    parse_number(&reply, "reading")
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl Identify for Ql355 {
    async fn identity(&self) -> AppResult<String> {
        self.device
            .run("identity", |s| s.query("*IDN?").boxed())
            .await
    }

    async fn ping(&self) -> AppResult<bool> {
        Ok(PsuModel::from_idn(&self.identity().await?).is_ok())
    }
}

#[async_trait]
impl VoltageSource for Ql355 {
    async fn set_voltage_limit(&self, channel: usize, volts: f64) -> AppResult<()> {
        check_range("voltage", volts, 0.0, MAX_VOLTAGE)?;
        self.set_limit("set_voltage_limit", 'V', channel, volts).await
    }

    async fn voltage_limit(&self, channel: usize) -> AppResult<f64> {
        self.get_limit("get_voltage_limit", 'V', channel).await
    }

    async fn set_current_limit(&self, channel: usize, amps: f64) -> AppResult<()> {
        check_range("current", amps, 0.0, MAX_CURRENT)?;
        self.set_limit("set_current_limit", 'I', channel, amps).await
    }

    async fn current_limit(&self, channel: usize) -> AppResult<f64> {
        self.get_limit("get_current_limit", 'I', channel).await
    }

    async fn measured_voltage(&self, channel: usize) -> AppResult<f64> {
        self.measure("get_voltage", 'V', channel).await
    }

    async fn measured_current(&self, channel: usize) -> AppResult<f64> {
        self.measure("get_current", 'I', channel).await
    }

    async fn set_output_enable(&self, channel: usize, enable: bool) -> AppResult<()> {
        self.device
            .run("set_output_enable", move |s| {
                async move {
                    model(s).await?.check_channel(channel, true)?;
                    s.send(&format!("OP{} {}", channel + 1, u8::from(enable)))
                        .await
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl RpcTarget for Ql355 {
    fn methods(&self) -> Vec<MethodInfo> {
        METHODS.to_vec()
    }

    async fn call(&self, method: &str, args: CallArgs) -> AppResult<Value> {
        match method {
            "identity" => ret(self.identity().await?),
            "ping" => ret(self.ping().await?),
            "model" => ret(self.model().await?),
            "set_voltage_limit" => {
                args.expect_at_most(2)?;
                let volts = args.get(0, "volts")?;
                ret(self.set_voltage_limit(args.get_or(1, "channel", 0)?, volts).await?)
            }
            "get_voltage_limit" => ret(self.voltage_limit(args.get_or(0, "channel", 0)?).await?),
            "set_current_limit" => {
                args.expect_at_most(2)?;
                let amps = args.get(0, "amps")?;
                ret(self.set_current_limit(args.get_or(1, "channel", 0)?, amps).await?)
            }
            "get_current_limit" => ret(self.current_limit(args.get_or(0, "channel", 0)?).await?),
            "get_voltage" => ret(self.measured_voltage(args.get_or(0, "channel", 0)?).await?),
            "get_current" => ret(self.measured_current(args.get_or(0, "channel", 0)?).await?),
            "set_output_enable" => {
                args.expect_at_most(2)?;
                let enable = args.get(0, "enable")?;
                ret(self.set_output_enable(args.get_or(1, "channel", 0)?, enable).await?)
            }
            "get_output_enable" => ret(self.output_enabled(args.get_or(0, "channel", 0)?).await?),
            "set_voltage_step" => {
                args.expect_at_most(2)?;
                let volts = args.get(0, "volts")?;
                ret(self.set_voltage_step(args.get_or(1, "channel", 0)?, volts).await?)
            }
            "increment_voltage" => {
                ret(self.increment_voltage(args.get_or(0, "channel", 0)?).await?)
            }
            "check_trip" => ret(self.check_trip(args.get_or(0, "channel", 0)?).await?),
            "reset_trip" => ret(self.reset_trip().await?),
            other => Err(ControllerError::UnknownMethod(other.to_string())),
        }
    }

    async fn close(&self, timeout: Duration) -> AppResult<()> {
        self.device.close(timeout).await
    }
}

#[derive(Debug, Clone, Default)]
struct SimChannel {
    volts: f64,
    amps: f64,
    step: f64,
    output: bool,
    status: u32,
}

/// Emulates a QL355 supply answering the subset of commands the driver uses.
#[derive(Debug, Clone)]
pub struct Ql355Simulator {
    model: PsuModel,
    channels: [SimChannel; 3],
}

impl Ql355Simulator {
    /// Simulated supply of the given model, outputs off.
    pub fn new(model: PsuModel) -> Self {
        Self {
            model,
            channels: Default::default(),
        }
    }

    /// Latch limit-status bits on a channel, as a protection trip would.
    pub fn with_status(mut self, channel: usize, status: u32) -> Self {
        if let Some(ch) = self.channels.get_mut(channel) {
            ch.status = status;
            ch.output = false;
        }
        self
    }

    fn handle(&mut self, header: &str, arg: Option<&str>) -> Option<String> {
        let query = header.ends_with('?');
        let header = header.trim_end_matches('?');

        if header == "*IDN" && query {
            return Some(format!("THURLBY THANDAR, {}, 123456, 1.00", self.model));
        }
        if header == "TRIPRST" {
            for ch in &mut self.channels {
                ch.status = 0;
            }
            return None;
        }

        let split = header.find(|c: char| c.is_ascii_digit())?;
        let (name, rest) = header.split_at(split);
        let mut rest = rest.chars();
        let number = rest.next()?.to_digit(10)? as usize;
        let suffix: String = rest.collect();
        let ch = self.channels.get_mut(number.checked_sub(1)?)?;
        let value = arg.and_then(|a| a.parse::<f64>().ok());

        match (name, suffix.as_str(), query) {
            ("V", "", true) => Some(format!("V{} {:.3}", number, ch.volts)),
            ("V", "", false) => {
                ch.volts = value?;
                None
            }
            ("I", "", true) => Some(format!("I{} {:.4}", number, ch.amps)),
            ("I", "", false) => {
                ch.amps = value?;
                None
            }
            ("V", "O", true) => Some(format!("{:.3}V", if ch.output { ch.volts } else { 0.0 })),
            // no load connected
            ("I", "O", true) => Some("0.0000A".to_string()),
            ("OP", "", true) => Some(u8::from(ch.output).to_string()),
            ("OP", "", false) => {
                ch.output = value? != 0.0;
                None
            }
            ("DELTAV", "", false) => {
                ch.step = value?;
                None
            }
            ("INCV", "", false) => {
                ch.volts = (ch.volts + ch.step).min(MAX_VOLTAGE);
                None
            }
            ("LSR", "", true) => Some(ch.status.to_string()),
            _ => None,
        }
    }
}

impl Responder for Ql355Simulator {
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>> {
        let cmd = sim_command(command);
        if cmd.is_empty() {
            return None;
        }
        let (header, arg) = match cmd.split_once(' ') {
            Some((h, a)) => (h, Some(a.trim())),
            None => (cmd.as_str(), None),
        };
        self.handle(&header.to_ascii_uppercase(), arg)
            .and_then(sim_reply)
    }
}
