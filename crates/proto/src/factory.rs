//! Named-constructor payloads.
//!
//! The original system shipped live class objects over the wire; here the
//! payload is only a factory *name* plus its arguments, and every party maps
//! names to constructors through its own registry. New attacks, models or
//! datasets are added by redeploying, not by sending code.

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorySpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl FactorySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn kwarg_u64(&self, key: &str) -> Option<u64> {
        self.kwargs.get(key).and_then(serde_json::Value::as_u64)
    }

    pub fn kwarg_bool(&self, key: &str) -> Option<bool> {
        self.kwargs.get(key).and_then(serde_json::Value::as_bool)
    }

    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(serde_json::Value::as_str)
    }
}
