//! Controller configuration using Figment.
//!
//! Settings for one controller process are resolved from, in increasing priority:
//! 1. Built-in defaults
//! 2. The per-user device store, `$CONFIG_DIR/daq-controller/devices.toml`, under the
//!    `[devices.<name>]` table of the device being served
//! 3. Environment variables prefixed with `DAQCTL_` (nested keys split by `__`)
//! 4. Command-line flags, applied through [`Overrides`]
//!
//! # Device store
//!
//! ```toml
//! [devices.psu_bench3]
//! device.target = "/dev/ttyACM0"
//! device.timeout = "500ms"
//! rpc.port = 4006
//! retry.max_attempts = 5
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DAQCTL_DEVICE__TARGET=192.168.1.40:9221
//! DAQCTL_RPC__PORT=4010
//! DAQCTL_LOCK_TIMEOUT=30s
//! ```

use crate::channel::RetryPolicy;
use crate::transport::{ConnectionDescriptor, FlowControl, Parity, SerialSettings};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or merge a source
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of bounds
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQCTL_";

/// Everything one controller process needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Link to the physical device
    pub device: DeviceConfig,
    /// RPC listener
    pub rpc: RpcConfig,
    /// Retry policy for every command channel
    pub retry: RetryPolicy,
    /// Longest a call waits for the device before failing with `LockTimeout`
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// How long shutdown waits for in-flight calls
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            rpc: RpcConfig::default(),
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Physical link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial device path, `host:port` or `tcp://host:port`
    #[serde(default)]
    pub target: Option<String>,
    /// Overrides the driver's default baud rate
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Serial data bits (5-8)
    pub data_bits: u8,
    /// Serial stop bits (1 or 2)
    pub stop_bits: u8,
    /// Serial parity
    pub parity: Parity,
    /// Serial flow control
    pub flow_control: FlowControl,
    /// Read timeout per framed response
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Expected serial number, checked against `*IDN?` at startup
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            target: None,
            baud_rate: None,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
            timeout: ConnectionDescriptor::DEFAULT_TIMEOUT,
            serial_number: None,
        }
    }
}

/// RPC listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Interface to listen on
    pub bind: String,
    /// Falls back to the driver's well-known port
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

/// Command-line values that win over every other source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Device path or `host[:port]`
    pub target: Option<String>,
    /// RPC bind address
    pub bind: Option<String>,
    /// RPC port
    pub port: Option<u16>,
    /// Device lock timeout
    pub lock_timeout: Option<Duration>,
    /// Shutdown grace period
    pub shutdown_grace: Option<Duration>,
}

/// Default location of the per-user device store.
pub fn default_store_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("daq-controller").join("devices.toml"))
}

impl ControllerConfig {
    /// Resolve the configuration of device `name`.
    ///
    /// # Arguments
    /// * `name` - Device key in the store (`[devices.<name>]`)
    /// * `store` - Explicit store file; the per-user store is used when `None`
    ///
    /// # Errors
    /// Returns a ConfigError if an explicit store is missing, a source cannot be
    /// parsed, or the merged values fail validation.
    pub fn load(name: &str, store: Option<&Path>) -> Result<Self, ConfigError> {
        let store = match store {
            Some(path) if !path.exists() => {
                return Err(ConfigError::ValidationError(format!(
                    "configuration file {} does not exist",
                    path.display()
                )))
            }
            Some(path) => Some(path.to_path_buf()),
            None => default_store_path(),
        };

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = store {
            let device_table = Figment::from(Toml::file(path)).focus(&format!("devices.{}", name));
            figment = figment.merge(device_table);
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Apply command-line values and re-validate.
    pub fn apply(&mut self, overrides: &Overrides) -> Result<(), ConfigError> {
        if let Some(target) = &overrides.target {
            self.device.target = Some(target.clone());
        }
        if let Some(bind) = &overrides.bind {
            self.rpc.bind = bind.clone();
        }
        if let Some(port) = overrides.port {
            self.rpc.port = Some(port);
        }
        if let Some(timeout) = overrides.lock_timeout {
            self.lock_timeout = timeout;
        }
        if let Some(grace) = overrides.shutdown_grace {
            self.shutdown_grace = grace;
        }
        self.validate()
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Timeouts are non-zero
    /// - At least one attempt per transaction
    /// - Serial line settings are representable
    /// - The bind address is set
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "device.timeout must be greater than zero".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "lock_timeout must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "retry.backoff_multiplier must be finite and >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if !(5..=8).contains(&self.device.data_bits) {
            return Err(ConfigError::ValidationError(format!(
                "device.data_bits must be 5-8, got {}",
                self.device.data_bits
            )));
        }
        if !matches!(self.device.stop_bits, 1 | 2) {
            return Err(ConfigError::ValidationError(format!(
                "device.stop_bits must be 1 or 2, got {}",
                self.device.stop_bits
            )));
        }
        if self.rpc.bind.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "rpc.bind must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Descriptor of the live device link.
    ///
    /// # Arguments
    /// * `default_tcp_port` - Port used for a bare host name
    /// * `default_baud` - Baud rate used unless `device.baud_rate` is set
    pub fn descriptor(
        &self,
        default_tcp_port: Option<u16>,
        default_baud: u32,
    ) -> crate::error::AppResult<ConnectionDescriptor> {
        let target = self.device.target.as_deref().ok_or_else(|| {
            ConfigError::ValidationError(
                "no device target configured (use --device or --simulation)".to_string(),
            )
        })?;
        let serial = SerialSettings {
            path: String::new(),
            baud_rate: self.device.baud_rate.unwrap_or(default_baud),
            data_bits: self.device.data_bits,
            stop_bits: self.device.stop_bits,
            parity: self.device.parity,
            flow_control: self.device.flow_control,
        };
        ConnectionDescriptor::parse_target(target, &serial, default_tcp_port, self.device.timeout)
    }

    /// RPC port, falling back to `default_port`.
    pub fn rpc_port(&self, default_port: u16) -> u16 {
        self.rpc.port.unwrap_or(default_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;
    use figment::Jail;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rpc_port(4006), 4006);
    }

    #[test]
    fn test_device_table_is_selected_by_name() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "devices.toml",
                r#"
[devices.psu_a]
device.target = "/dev/ttyACM0"
device.timeout = "250ms"
rpc.port = 4100

[devices.psu_b]
device.target = "10.0.0.5"
retry.max_attempts = 7
"#,
            )?;
            let store = Some(Path::new("devices.toml"));

            let a = ControllerConfig::load("psu_a", store).map_err(|e| e.to_string())?;
            assert_eq!(a.device.target.as_deref(), Some("/dev/ttyACM0"));
            assert_eq!(a.device.timeout, Duration::from_millis(250));
            assert_eq!(a.rpc.port, Some(4100));
            assert_eq!(a.retry.max_attempts, 3);

            let b = ControllerConfig::load("psu_b", store).map_err(|e| e.to_string())?;
            assert_eq!(b.retry.max_attempts, 7);
            // untouched keys keep their defaults
            assert_eq!(b.retry.backoff, Duration::from_millis(100));
            assert_eq!(b.device.timeout, ConnectionDescriptor::DEFAULT_TIMEOUT);

            let desc = b.descriptor(Some(9221), 19200).map_err(|e| e.to_string())?;
            assert!(matches!(desc.endpoint, Endpoint::Tcp { port: 9221, .. }));
            Ok(())
        });
    }

    #[test]
    fn test_store_file_outside_jail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[devices.scope]\ndevice.data_bits = 9").unwrap();
        let err = ControllerConfig::load("scope", Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_missing_explicit_store_is_error() {
        let err = ControllerConfig::load("x", Some(Path::new("/nonexistent/devices.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "devices.toml",
                r#"
[devices.synth]
device.target = "synth-1:5025"
rpc.port = 4300
"#,
            )?;
            jail.set_env("DAQCTL_RPC__PORT", "4400");
            jail.set_env("DAQCTL_LOCK_TIMEOUT", "30s");

            let config = ControllerConfig::load("synth", Some(Path::new("devices.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.rpc.port, Some(4400));
            assert_eq!(config.lock_timeout, Duration::from_secs(30));
            assert_eq!(config.device.target.as_deref(), Some("synth-1:5025"));
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = ControllerConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_unbounded_multiplier() {
        let mut config = ControllerConfig::default();
        config.retry.backoff_multiplier = f64::INFINITY;
        assert!(config.validate().is_err());
        config.retry.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());
        config.retry.backoff_multiplier = 1e10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = ControllerConfig::default();
        config
            .apply(&Overrides {
                target: Some("COM4".into()),
                port: Some(5000),
                shutdown_grace: Some(Duration::from_secs(1)),
                ..Overrides::default()
            })
            .unwrap();
        assert_eq!(config.rpc_port(4006), 5000);
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));

        let desc = config.descriptor(None, 19200).unwrap();
        match desc.endpoint {
            Endpoint::Serial(s) => assert_eq!(s.baud_rate, 19200),
            other => panic!("expected serial endpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_requires_target() {
        let config = ControllerConfig::default();
        assert!(config.descriptor(Some(5025), 9600).is_err());
    }
}
