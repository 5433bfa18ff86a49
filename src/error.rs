//! Custom error types for the controller.
//!
//! This module defines the primary error type, `ControllerError`, shared by every layer
//! between the physical link and the RPC boundary. Using the `thiserror` crate, it gives
//! each failure a precise variant so that the retry policy and the RPC boundary can act
//! on the *kind* of failure rather than on message text.
//!
//! ## Error Hierarchy
//!
//! - **Link errors** (`LinkUnavailable`, `LinkTimeout`, `LinkBroken`): produced by a
//!   [`Transport`](crate::transport::Transport). `LinkTimeout` and `LinkBroken` are
//!   transient and drive the reconnect-and-retry policy of the
//!   [`CommandChannel`](crate::channel::CommandChannel). `LinkUnavailable` is fatal at
//!   startup and retryable during a reconnect.
//! - **`Protocol`**: the instrument answered, but not in the expected shape. Never retried.
//! - **`DeviceUnresponsive`**: the retry budget was exhausted.
//! - **`LockTimeout`**: another caller held the device for longer than the caller waited.
//! - **`ControllerShuttingDown`**: the call arrived after shutdown began.
//! - **Semantic device errors** (`OutOfRange`, `InterlockTripped`, `InvalidArgument`):
//!   raised by drivers while validating requests or interpreting responses.
//! - **RPC errors** (`UnknownMethod`, `InvalidRequest`): malformed remote calls.
//! - **`Remote`**: an error record received back from a controller by the
//!   [`RpcClient`](crate::rpc::RpcClient); it keeps the remote kind.
//! - **`Config`**, **`Io`**, **`Internal`**: ambient failures.
//!
//! Every variant maps onto an [`ErrorKind`], the stable discriminant that crosses the RPC
//! boundary together with the display message.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type AppResult<T> = std::result::Result<T, ControllerError>;

/// Errors produced anywhere between the physical link and the RPC boundary.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The link could not be opened
    #[error("Link unavailable ({target}): {reason}")]
    LinkUnavailable {
        /// Device path or address
        target: String,
        /// Why opening failed
        reason: String,
    },

    /// No complete response within the read timeout
    #[error("Link timed out after {0:?}")]
    LinkTimeout(Duration),

    /// The link failed mid-transaction
    #[error("Link broken: {0}")]
    LinkBroken(String),

    /// The device answered something unexpected
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Retry budget exhausted
    #[error("Device unresponsive after {attempts} attempt(s); last error: {last}")]
    DeviceUnresponsive {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: String,
    },

    /// Device lock not acquired in time
    #[error("Timed out after {waited:?} waiting for device '{device}' (held by {holder})")]
    LockTimeout {
        /// Device that stayed busy
        device: String,
        /// Operation holding it when the wait ran out
        holder: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// New calls are refused during shutdown
    #[error("Controller is shutting down")]
    ControllerShuttingDown,

    /// Setpoint outside the instrument's range
    #[error("{quantity} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        /// What was being set, e.g. `voltage`
        quantity: String,
        /// Rejected value
        value: f64,
        /// Lowest accepted value
        min: f64,
        /// Highest accepted value
        max: f64,
    },

    /// The instrument reported a protection trip
    #[error("Interlock tripped: {0}")]
    InterlockTripped(String),

    /// Argument has the wrong type or value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No such method on the target
    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    /// Request could not be decoded or routed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error record returned by a remote controller
    #[error("Remote call failed: {0}")]
    Remote(RemoteError),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bug or unexpected state
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Stable discriminant for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LinkUnavailable { .. } => ErrorKind::LinkUnavailable,
            Self::LinkTimeout(_) => ErrorKind::LinkTimeout,
            Self::LinkBroken(_) => ErrorKind::LinkBroken,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::DeviceUnresponsive { .. } => ErrorKind::DeviceUnresponsive,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::ControllerShuttingDown => ErrorKind::ControllerShuttingDown,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::InterlockTripped(_) => ErrorKind::InterlockTripped,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::UnknownMethod(_) => ErrorKind::UnknownMethod,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Config(_) => ErrorKind::Config,
            Self::Remote(remote) => remote.kind,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for link failures that the channel may recover from by reconnecting.
    pub fn is_link_transient(&self) -> bool {
        matches!(self, Self::LinkTimeout(_) | Self::LinkBroken(_))
    }

    /// Convenience constructor for [`ControllerError::OutOfRange`].
    pub fn out_of_range(quantity: impl Into<String>, value: f64, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            quantity: quantity.into(),
            value,
            min,
            max,
        }
    }

    /// Convert into the record that crosses the RPC boundary.
    pub fn to_remote(&self) -> RemoteError {
        if let Self::Remote(remote) = self {
            return remote.clone();
        }
        RemoteError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serializable error discriminant used on the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`ControllerError::LinkUnavailable`]
    LinkUnavailable,
    /// See [`ControllerError::LinkTimeout`]
    LinkTimeout,
    /// See [`ControllerError::LinkBroken`]
    LinkBroken,
    /// See [`ControllerError::Protocol`]
    ProtocolError,
    /// See [`ControllerError::DeviceUnresponsive`]
    DeviceUnresponsive,
    /// See [`ControllerError::LockTimeout`]
    LockTimeout,
    /// See [`ControllerError::ControllerShuttingDown`]
    ControllerShuttingDown,
    /// See [`ControllerError::OutOfRange`]
    OutOfRange,
    /// See [`ControllerError::InterlockTripped`]
    InterlockTripped,
    /// See [`ControllerError::InvalidArgument`]
    InvalidArgument,
    /// See [`ControllerError::UnknownMethod`]
    UnknownMethod,
    /// See [`ControllerError::InvalidRequest`]
    InvalidRequest,
    /// See [`ControllerError::Config`]
    Config,
    /// See [`ControllerError::Io`]
    Io,
    /// See [`ControllerError::Internal`]
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Structured error record (kind + message) returned to remote callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Error discriminant
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
