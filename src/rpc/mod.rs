//! Remote procedure calls over newline-delimited JSON.
//!
//! Each request and each response is one JSON object on one line, so a controller can
//! be driven with nothing more than `nc`:
//!
//! ```text
//! → {"id":1,"method":"set_voltage","args":[12.0],"kwargs":{"channel":0}}
//! ← {"id":1,"status":"ok","ret":null}
//! → {"id":2,"method":"set_voltage","args":[99.0]}
//! ← {"id":2,"status":"failed","error":{"kind":"OutOfRange","message":"voltage out of range: 99 (allowed 0..=35)"}}
//! ```
//!
//! Requests on one connection are answered in order. The optional `target` field picks
//! the published object; it defaults to the controller's only driver.

pub mod client;
pub mod server;
pub mod service;

pub use client::RpcClient;
pub use server::{RpcHandler, RpcServer};
pub use service::{ret, CallArgs, MethodInfo, RpcTarget};

use crate::error::{AppResult, ControllerError, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Longest accepted request or response line.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Method name answered by every controller to check liveness.
pub const PING: &str = "__ping__";
/// Lists the published target names.
pub const TARGETS: &str = "__targets__";
/// Lists a target's methods with signatures and docs.
pub const LIST_METHODS: &str = "__list_methods__";

/// One call as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Echoed in the response
    pub id: u64,
    /// Published target name; the controller's default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Method to invoke
    pub method: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl RpcRequest {
    /// Request for `method` on the default target.
    pub fn new(id: u64, method: impl Into<String>, args: CallArgs) -> Self {
        Self {
            id,
            target: None,
            method: method.into(),
            args: args.args,
            kwargs: args.kwargs,
        }
    }

    /// Split off the call arguments.
    pub fn call_args(&self) -> CallArgs {
        CallArgs::new(self.args.clone(), self.kwargs.clone())
    }
}

/// Reply to one [`RpcRequest`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the request this answers
    pub id: u64,
    /// Result of the call
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

/// Success or failure of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RpcOutcome {
    /// Call succeeded
    Ok {
        /// Return value
        ret: Value,
    },
    /// Call failed
    Failed {
        /// Kind and message of the failure
        error: RemoteError,
    },
}

impl RpcResponse {
    /// Successful reply.
    pub fn ok(id: u64, ret: Value) -> Self {
        Self {
            id,
            outcome: RpcOutcome::Ok { ret },
        }
    }

    /// Failed reply carrying the error's kind and message.
    pub fn failed(id: u64, error: &ControllerError) -> Self {
        Self {
            id,
            outcome: RpcOutcome::Failed {
                error: error.to_remote(),
            },
        }
    }

    /// Reply for the outcome of a call.
    pub fn from_result(id: u64, result: AppResult<Value>) -> Self {
        match result {
            Ok(ret) => Self::ok(id, ret),
            Err(e) => Self::failed(id, &e),
        }
    }

    /// Return value, or the remote error record as [`ControllerError::Remote`].
    pub fn into_result(self) -> AppResult<Value> {
        match self.outcome {
            RpcOutcome::Ok { ret } => Ok(ret),
            RpcOutcome::Failed { error } => Err(ControllerError::Remote(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let req: RpcRequest = serde_json::from_str(r#"{"id":4,"method":"identity"}"#).unwrap();
        assert_eq!(req.id, 4);
        assert_eq!(req.target, None);
        assert!(req.call_args().is_empty());
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = serde_json::to_value(RpcResponse::ok(1, json!(12.5))).unwrap();
        assert_eq!(ok, json!({"id": 1, "status": "ok", "ret": 12.5}));

        let err = ControllerError::InterlockTripped("channel 0 over-voltage".into());
        let failed = serde_json::to_value(RpcResponse::failed(2, &err)).unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["error"]["kind"], "InterlockTripped");
    }

    #[test]
    fn test_failed_response_keeps_kind() {
        let line = r#"{"id":3,"status":"failed","error":{"kind":"LockTimeout","message":"busy"}}"#;
        let response: RpcResponse = serde_json::from_str(line).unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }
}
