//! Core library for resilient instrument controllers.
//!
//! A controller process wraps one lab instrument (power supply, synthesizer, generic
//! SCPI device) reachable over a serial line or TCP, and publishes the driver's
//! methods to remote callers. The layers, from the wire up:
//!
//! - [`transport`]: one physical link (serial, TCP, or simulated) with framed reads.
//! - [`channel`]: atomic command/response transactions with reconnect and bounded retry.
//! - [`lock`]: exclusive, timed access to one device for concurrent callers.
//! - [`device`]: lock-guarded sessions that drivers run their operations in.
//! - [`drivers`]: typed operations for each instrument family.
//! - [`rpc`] and [`host`]: the JSON-lines RPC boundary and the controller lifecycle.

pub mod channel;
pub mod config;
pub mod device;
pub mod drivers;
pub mod error;
pub mod host;
pub mod lock;
pub mod rpc;
pub mod transport;

pub use channel::{CommandChannel, Response, RetryPolicy, Transaction};
pub use config::{ConfigError, ControllerConfig, Overrides};
pub use device::{CachedState, Device, Session};
pub use drivers::DriverKind;
pub use error::{AppResult, ControllerError, ErrorKind, RemoteError};
pub use host::{ControllerHost, HostPhase, RunMode, ShutdownReport};
pub use lock::{DeviceGuard, DeviceLock};
pub use rpc::{RpcClient, RpcTarget};
pub use transport::{ConnectionDescriptor, LinkState, Transport};
