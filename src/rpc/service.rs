//! The seam between drivers and the RPC boundary.

use crate::error::{AppResult, ControllerError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// Description of one remotely callable method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodInfo {
    /// Method name as called remotely
    pub name: &'static str,
    /// Parameter list as shown to callers, e.g. `(channel=0, volts)`
    pub signature: &'static str,
    /// One-line description
    pub doc: &'static str,
}

impl MethodInfo {
    /// Describe one method.
    pub const fn new(name: &'static str, signature: &'static str, doc: &'static str) -> Self {
        Self {
            name,
            signature,
            doc,
        }
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    /// Positional arguments
    pub args: Vec<Value>,
    /// Keyword arguments
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    /// Positional and keyword arguments.
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional arguments only.
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// No arguments of either kind.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Required argument, by keyword `name` or at position `index`.
    ///
    /// # Errors
    /// `InvalidArgument` if the argument is missing or has the wrong type.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> AppResult<T> {
        self.lookup(index, name)?.ok_or_else(|| {
            ControllerError::InvalidArgument(format!("missing argument '{}'", name))
        })
    }

    /// Optional argument with a fallback value.
    pub fn get_or<T: DeserializeOwned>(&self, index: usize, name: &str, default: T) -> AppResult<T> {
        Ok(self.lookup(index, name)?.unwrap_or(default))
    }

    /// Reject calls carrying more positional arguments than the method takes.
    pub fn expect_at_most(&self, count: usize) -> AppResult<()> {
        if self.args.len() > count {
            return Err(ControllerError::InvalidArgument(format!(
                "expected at most {} positional argument(s), got {}",
                count,
                self.args.len()
            )));
        }
        Ok(())
    }

    fn lookup<T: DeserializeOwned>(&self, index: usize, name: &str) -> AppResult<Option<T>> {
        let value = match (self.kwargs.get(name), self.args.get(index)) {
            (Some(_), Some(_)) => {
                return Err(ControllerError::InvalidArgument(format!(
                    "argument '{}' given both by position and by keyword",
                    name
                )))
            }
            (Some(v), None) | (None, Some(v)) => v,
            (None, None) => return Ok(None),
        };
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| ControllerError::InvalidArgument(format!("argument '{}': {}", name, e)))
    }
}

/// Serialize a method's return value.
pub fn ret<T: Serialize>(value: T) -> AppResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| ControllerError::Internal(format!("unserializable return value: {}", e)))
}

/// An object whose methods are published over RPC.
#[async_trait]
pub trait RpcTarget: Send + Sync {
    /// Published methods.
    fn methods(&self) -> Vec<MethodInfo>;

    /// Invoke `method`. Unknown names fail with `UnknownMethod`.
    async fn call(&self, method: &str, args: CallArgs) -> AppResult<Value>;

    /// Release the device once idle, waiting at most `timeout` for in-progress work.
    async fn close(&self, timeout: Duration) -> AppResult<()>;
}
