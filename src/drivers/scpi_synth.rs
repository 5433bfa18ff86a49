//! Generic SCPI-compliant frequency synthesizer.

use super::{check_range, parse_flag, parse_number, sim_command, sim_reply, DriverOptions};
use super::{FrequencySource, Identify};
use crate::channel::CommandChannel;
use crate::device::{CachedState, Device};
use crate::error::{AppResult, ControllerError};
use crate::rpc::{ret, CallArgs, MethodInfo, RpcTarget};
use crate::transport::Responder;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Lowest settable frequency in Hz
pub const MIN_FREQUENCY: f64 = 1.0e3;
/// Highest settable frequency in Hz
pub const MAX_FREQUENCY: f64 = 40.0e9;
/// Lowest output power in dBm
pub const MIN_POWER: f64 = -130.0;
/// Highest output power in dBm
pub const MAX_POWER: f64 = 25.0;

/// Last programmed settings, so reads don't have to hit the instrument.
#[derive(Debug, Default)]
struct SynthState {
    frequency: Option<f64>,
    power: Option<f64>,
    rf_on: Option<bool>,
}

impl CachedState for SynthState {
    fn invalidate(&mut self) {
        *self = Self::default();
    }
}

/// Driver for SCPI synthesizers.
pub struct ScpiSynth {
    device: Device<SynthState>,
}

const METHODS: &[MethodInfo] = &[
    MethodInfo::new("identity", "()", "Device identity string"),
    MethodInfo::new("ping", "()", "True if the synth answers *IDN?"),
    MethodInfo::new("set_freq", "(freq)", "Program the output frequency in Hz"),
    MethodInfo::new("get_freq", "()", "Current frequency setting in Hz"),
    MethodInfo::new("set_power", "(power)", "Program the output power in dBm"),
    MethodInfo::new("get_power", "()", "Current power setting in dBm"),
    MethodInfo::new("set_rf_on", "(enabled)", "Switch the RF output"),
    MethodInfo::new("get_rf_on", "()", "True if the RF output is on"),
];

impl ScpiSynth {
    /// Open the link and check the instrument answers.
    pub async fn connect(channel: CommandChannel, options: &DriverOptions) -> AppResult<Self> {
        let device = Device::new(
            options.name.clone(),
            channel,
            SynthState::default(),
            options.lock_timeout,
        );
        device.connect().await?;
        let driver = Self { device };

        if !driver.ping().await? {
            return Err(ControllerError::Protocol(
                "synthesizer returned an empty identity".to_string(),
            ));
        }
        info!(device = %options.name, "Synth ready");
        Ok(driver)
    }
}

#[async_trait]
impl Identify for ScpiSynth {
    async fn identity(&self) -> AppResult<String> {
        self.device
            .run("identity", |s| s.query("*IDN?").boxed())
            .await
    }

    async fn ping(&self) -> AppResult<bool> {
        Ok(!self.identity().await?.is_empty())
    }
}

#[async_trait]
impl FrequencySource for ScpiSynth {
    async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        check_range("frequency", hz, MIN_FREQUENCY, MAX_FREQUENCY)?;
        self.device
            .run("set_freq", move |s| {
                async move {
                    s.send(&format!("FREQ {} HZ", hz)).await?;
                    s.state.frequency = Some(hz);
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    async fn frequency(&self) -> AppResult<f64> {
        self.device
            .run("get_freq", |s| {
                async move {
                    if let Some(hz) = s.state.frequency {
                        return Ok(hz);
                    }
                    let hz = parse_number(&s.query("FREQ?").await?, "frequency")?;
                    s.state.frequency = Some(hz);
                    Ok(hz)
                }
                .boxed()
            })
            .await
    }

    async fn set_power(&self, dbm: f64) -> AppResult<()> {
        check_range("power", dbm, MIN_POWER, MAX_POWER)?;
        self.device
            .run("set_power", move |s| {
                async move {
                    s.send(&format!("POW {} DBM", dbm)).await?;
                    s.state.power = Some(dbm);
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    async fn power(&self) -> AppResult<f64> {
        self.device
            .run("get_power", |s| {
                async move {
                    if let Some(dbm) = s.state.power {
                        return Ok(dbm);
                    }
                    let dbm = parse_number(&s.query("POW?").await?, "power")?;
                    s.state.power = Some(dbm);
                    Ok(dbm)
                }
                .boxed()
            })
            .await
    }

    async fn set_rf_enable(&self, enable: bool) -> AppResult<()> {
        self.device
            .run("set_rf_on", move |s| {
                async move {
                    s.send(&format!("OUTP {}", u8::from(enable))).await?;
                    s.state.rf_on = Some(enable);
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    async fn rf_enabled(&self) -> AppResult<bool> {
        self.device
            .run("get_rf_on", |s| {
                async move {
                    if let Some(on) = s.state.rf_on {
                        return Ok(on);
                    }
                    let on = parse_flag(&s.query("OUTP?").await?, "RF output")?;
                    s.state.rf_on = Some(on);
                    Ok(on)
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl RpcTarget for ScpiSynth {
    fn methods(&self) -> Vec<MethodInfo> {
        METHODS.to_vec()
    }

    async fn call(&self, method: &str, args: CallArgs) -> AppResult<Value> {
        match method {
            "identity" => ret(self.identity().await?),
            "ping" => ret(self.ping().await?),
            "set_freq" => {
                args.expect_at_most(1)?;
                ret(self.set_frequency(args.get(0, "freq")?).await?)
            }
            "get_freq" => ret(self.frequency().await?),
            "set_power" => {
                args.expect_at_most(1)?;
                ret(self.set_power(args.get(0, "power")?).await?)
            }
            "get_power" => ret(self.power().await?),
            "set_rf_on" => {
                args.expect_at_most(1)?;
                ret(self.set_rf_enable(args.get(0, "enabled")?).await?)
            }
            "get_rf_on" => ret(self.rf_enabled().await?),
            other => Err(ControllerError::UnknownMethod(other.to_string())),
        }
    }

    async fn close(&self, timeout: Duration) -> AppResult<()> {
        self.device.close(timeout).await
    }
}

/// Emulates a synthesizer that powers up at 1 GHz, -10 dBm, RF off.
#[derive(Debug, Clone)]
pub struct SynthSimulator {
    frequency: f64,
    power: f64,
    rf_on: bool,
}

impl Default for SynthSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthSimulator {
    /// Synthesizer at 1 GHz, 0 dBm, RF off.
    pub fn new() -> Self {
        Self {
            frequency: 1.0e9,
            power: -10.0,
            rf_on: false,
        }
    }
}

impl Responder for SynthSimulator {
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>> {
        let cmd = sim_command(command).to_ascii_uppercase();
        let mut words = cmd.split_whitespace();
        let header = words.next()?;
        let value = words.next().and_then(|v| v.parse::<f64>().ok());

        match header {
            "*IDN?" => sim_reply("SIMULATED,SYNTH,0000,1.0"),
            "FREQ?" => sim_reply(format!("{:e}", self.frequency)),
            "POW?" => sim_reply(format!("{:.2}", self.power)),
            "OUTP?" => sim_reply(u8::from(self.rf_on)),
            "FREQ" => {
                self.frequency = value?;
                None
            }
            "POW" => {
                self.power = value?;
                None
            }
            "OUTP" => {
                self.rf_on = value? != 0.0;
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RetryPolicy;
    use crate::transport::{SimFault, SimulatedTransport, SimulationControl};

    async fn synth() -> (ScpiSynth, SimulationControl) {
        let sim = SimulatedTransport::new("synth", SynthSimulator::new());
        let control = sim.control();
        let channel = CommandChannel::new(Box::new(sim)).with_retry_policy(RetryPolicy {
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
        let driver = ScpiSynth::connect(channel, &DriverOptions::new("synth"))
            .await
            .unwrap();
        (driver, control)
    }

    fn queries(control: &SimulationControl, header: &str) -> usize {
        control
            .writes()
            .iter()
            .filter(|w| w.starts_with(header.as_bytes()))
            .count()
    }

    #[tokio::test]
    async fn test_power_up_state_read_from_device() {
        let (synth, _) = synth().await;
        assert_eq!(synth.frequency().await.unwrap(), 1.0e9);
        assert_eq!(synth.power().await.unwrap(), -10.0);
        assert!(!synth.rf_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_settings_served_from_cache() {
        let (synth, control) = synth().await;
        synth.set_frequency(2.5e9).await.unwrap();
        assert_eq!(synth.frequency().await.unwrap(), 2.5e9);
        assert_eq!(synth.frequency().await.unwrap(), 2.5e9);
        assert_eq!(queries(&control, "FREQ?"), 0);
        assert!(control.writes().contains(&b"FREQ 2500000000 HZ\n".to_vec()));
    }

    #[tokio::test]
    async fn test_cache_requeried_after_reconnect() {
        let (synth, control) = synth().await;
        synth.set_power(3.0).await.unwrap();
        assert_eq!(synth.power().await.unwrap(), 3.0);
        assert_eq!(queries(&control, "POW?"), 0);

        // the link drops during an unrelated exchange and comes back
        control.fail_next_read(SimFault::Broken);
        synth.identity().await.unwrap();

        assert_eq!(synth.power().await.unwrap(), 3.0);
        assert_eq!(queries(&control, "POW?"), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let (synth, _) = synth().await;
        assert!(matches!(
            synth.set_frequency(50.0e9).await,
            Err(ControllerError::OutOfRange { .. })
        ));
        assert!(matches!(
            synth.set_power(30.0).await,
            Err(ControllerError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_rf_switch_over_rpc() {
        let (synth, _) = synth().await;
        synth
            .call("set_rf_on", CallArgs::positional(vec![Value::from(true)]))
            .await
            .unwrap();
        let on = synth.call("get_rf_on", CallArgs::default()).await.unwrap();
        assert_eq!(on, Value::from(true));
    }
}
