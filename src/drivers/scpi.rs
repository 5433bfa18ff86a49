//! Generic IEEE-488.2 / SCPI instrument.
//!
//! Implements the common commands every SCPI instrument understands (`*IDN?`, `*RST`,
//! `*CLS`, `*OPC?`, `*TRG`, `SYST:ERR?`) plus raw `send`/`query` passthrough for
//! anything instrument specific. Default TCP port is 5025.

use super::{idn_fields, parse_flag, sim_command, sim_reply, DriverOptions, Identify};
use crate::channel::CommandChannel;
use crate::device::{CachedState, Device};
use crate::error::{AppResult, ControllerError};
use crate::rpc::{ret, CallArgs, MethodInfo, RpcTarget};
use crate::transport::Responder;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{info, warn};

/// One entry of the instrument's error queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemError {
    /// Error number, 0 for none
    pub code: i32,
    /// Error text as reported
    pub message: String,
}

impl SystemError {
    /// Parse a `SYST:ERR?` reply such as `-113,"Undefined header"`.
    pub fn parse(reply: &str) -> AppResult<Self> {
        let (code, message) = reply.split_once(',').ok_or_else(|| {
            ControllerError::Protocol(format!("malformed SYST:ERR? reply '{}'", reply))
        })?;
        let code = code.trim().parse::<i32>().map_err(|_| {
            ControllerError::Protocol(format!("malformed error code in '{}'", reply))
        })?;
        Ok(Self {
            code,
            message: message.trim().trim_matches('"').to_string(),
        })
    }

    /// True for anything but `0, "No error"`.
    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

#[derive(Debug, Default)]
struct ScpiState {
    /// `*IDN?` reply, valid until the link is re-established
    idn: Option<String>,
}

impl CachedState for ScpiState {
    fn invalidate(&mut self) {
        self.idn = None;
    }
}

/// Driver for a generic SCPI instrument.
pub struct ScpiDevice {
    device: Device<ScpiState>,
}

const METHODS: &[MethodInfo] = &[
    MethodInfo::new("identity", "()", "Device identity string (*IDN?)"),
    MethodInfo::new("ping", "()", "True if the device answers *IDN?"),
    MethodInfo::new("reset", "()", "Reset values to default (*RST)"),
    MethodInfo::new("clear_status", "()", "Clear status registers and error queue (*CLS)"),
    MethodInfo::new("check_error", "()", "Read and clear the oldest error (SYST:ERR?)"),
    MethodInfo::new("operation_complete", "()", "True once pending operations finished (*OPC?)"),
    MethodInfo::new("trigger", "()", "Bus trigger (*TRG); never repeated"),
    MethodInfo::new("send", "(command)", "Send a raw command; never repeated"),
    MethodInfo::new("query", "(command)", "Send a raw query and return the reply"),
];

impl ScpiDevice {
    /// Connect and read the identity, checking the serial number if one is expected.
    pub async fn connect(channel: CommandChannel, options: &DriverOptions) -> AppResult<Self> {
        let device = Device::new(
            options.name.clone(),
            channel,
            ScpiState::default(),
            options.lock_timeout,
        );
        device.connect().await?;
        let driver = Self { device };

        let idn = driver.identity().await?;
        if let Some(expected) = &options.serial_number {
            check_serial_number(&idn, expected)?;
        }
        info!(device = %options.name, %idn, "SCPI device ready");
        Ok(driver)
    }

    /// `*RST`
    pub async fn reset(&self) -> AppResult<()> {
        self.device
            .run("reset", |s| s.send("*RST").boxed())
            .await
    }

    /// `*CLS`
    pub async fn clear_status(&self) -> AppResult<()> {
        self.device
            .run("clear_status", |s| s.send("*CLS").boxed())
            .await
    }

    /// Read and clear the oldest entry of the error queue.
    pub async fn check_error(&self) -> AppResult<SystemError> {
        let error = self
            .device
            .run("check_error", |s| {
                async move { SystemError::parse(&s.query("SYST:ERR?").await?) }.boxed()
            })
            .await?;
        if error.is_error() {
            warn!(device = %self.device.name(), code = error.code, message = %error.message, "Instrument reported error");
        }
        Ok(error)
    }

    /// `*OPC?`
    pub async fn operation_complete(&self) -> AppResult<bool> {
        self.device
            .run("operation_complete", |s| {
                async move { parse_flag(&s.query("*OPC?").await?, "*OPC?") }.boxed()
            })
            .await
    }

    /// `*TRG`, sent once and never retried.
    pub async fn trigger(&self) -> AppResult<()> {
        self.device
            .run("trigger", |s| s.send_once("*TRG").boxed())
            .await
    }

    /// Raw command. Treated as non-idempotent since its effect is unknown.
    pub async fn send(&self, command: String) -> AppResult<()> {
        self.device
            .run("send", move |s| async move { s.send_once(&command).await }.boxed())
            .await
    }

    /// Raw query; the reply is returned trimmed.
    pub async fn query(&self, command: String) -> AppResult<String> {
        self.device
            .run("query", move |s| async move { s.query(&command).await }.boxed())
            .await
    }
}

fn check_serial_number(idn: &str, expected: &str) -> AppResult<()> {
    let fields = idn_fields(idn);
    match fields.get(2) {
        Some(serial) if serial == expected => Ok(()),
        Some(serial) => Err(ControllerError::InvalidArgument(format!(
            "serial number {} did not match expected ({})",
            serial, expected
        ))),
        None => Err(ControllerError::Protocol(format!(
            "identity '{}' has no serial number field",
            idn
        ))),
    }
}

#[async_trait]
impl Identify for ScpiDevice {
    async fn identity(&self) -> AppResult<String> {
        self.device
            .run("identity", |s| {
                async move {
                    if let Some(idn) = &s.state.idn {
                        return Ok(idn.clone());
                    }
                    let idn = s.query("*IDN?").await?;
                    s.state.idn = Some(idn.clone());
                    Ok(idn)
                }
                .boxed()
            })
            .await
    }

    /// Always asks the instrument, bypassing the cached identity.
    async fn ping(&self) -> AppResult<bool> {
        let idn = self
            .device
            .run("ping", |s| s.query("*IDN?").boxed())
            .await?;
        Ok(!idn.is_empty())
    }
}

#[async_trait]
impl RpcTarget for ScpiDevice {
    fn methods(&self) -> Vec<MethodInfo> {
        METHODS.to_vec()
    }

    async fn call(&self, method: &str, args: CallArgs) -> AppResult<Value> {
        match method {
            "identity" => ret(self.identity().await?),
            "ping" => ret(self.ping().await?),
            "reset" => ret(self.reset().await?),
            "clear_status" => ret(self.clear_status().await?),
            "check_error" => ret(self.check_error().await?),
            "operation_complete" => ret(self.operation_complete().await?),
            "trigger" => ret(self.trigger().await?),
            "send" => {
                args.expect_at_most(1)?;
                ret(self.send(args.get(0, "command")?).await?)
            }
            "query" => {
                args.expect_at_most(1)?;
                ret(self.query(args.get(0, "command")?).await?)
            }
            other => Err(ControllerError::UnknownMethod(other.to_string())),
        }
    }

    async fn close(&self, timeout: Duration) -> AppResult<()> {
        self.device.close(timeout).await
    }
}

/// Emulates a well-behaved SCPI instrument with an error queue.
#[derive(Debug, Clone)]
pub struct ScpiSimulator {
    identity: String,
    errors: VecDeque<String>,
}

impl Default for ScpiSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScpiSimulator {
    /// Simulator with a generic identity.
    pub fn new() -> Self {
        Self::with_identity("SIMULATED,SCPI-DEVICE,0000,1.0")
    }

    /// Simulator answering `*IDN?` with `identity`.
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            errors: VecDeque::new(),
        }
    }
}

impl Responder for ScpiSimulator {
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>> {
        let cmd = sim_command(command);
        match cmd.to_ascii_uppercase().as_str() {
            "*IDN?" => sim_reply(&self.identity),
            "*OPC?" => sim_reply(1),
            "SYST:ERR?" | "SYSTEM:ERROR?" => match self.errors.pop_front() {
                Some(err) => sim_reply(err),
                None => sim_reply("0,\"No error\""),
            },
            "*RST" | "*TRG" => None,
            "*CLS" => {
                self.errors.clear();
                None
            }
            _ => {
                self.errors.push_back("-113,\"Undefined header\"".to_string());
                None
            }
        }
    }
}
