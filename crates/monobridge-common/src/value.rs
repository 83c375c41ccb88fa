//! RPC value model
//!
//! RPC parameters and results cross the bridge as positional, typed
//! values. The engine reads and writes them in its own wire format; the
//! host sees them through typed accessors. `RpcValue` is the in-process
//! representation of one such value.
//!
//! # Type Mapping
//!
//! | RpcValue | JSON |
//! |----------|------|
//! | Null | null |
//! | Bool | boolean |
//! | I32 | number (integer) |
//! | F64 | number |
//! | Str | string |
//! | Error | `{"error": <inner>}` |
//!
//! JSON arrays and objects have no positional-parameter equivalent and
//! are rejected on conversion.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single RPC parameter or result value.
///
/// `Error` wraps another value and marks the call as failed; it nests so
/// that an error can itself carry a structured payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcValue {
    Null,
    Bool(bool),
    I32(i32),
    F64(f64),
    Str(String),
    Error(Box<RpcValue>),
}

impl RpcValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RpcValue::Null)
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            RpcValue::I32(v) => Ok(*v),
            _ => Err(BridgeError::ParamType { expected: "i32" }),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            RpcValue::F64(v) => Ok(*v),
            RpcValue::I32(v) => Ok(f64::from(*v)),
            _ => Err(BridgeError::ParamType { expected: "f64" }),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            RpcValue::Str(v) => Ok(v),
            _ => Err(BridgeError::ParamType { expected: "string" }),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            RpcValue::Bool(v) => Ok(*v),
            _ => Err(BridgeError::ParamType { expected: "bool" }),
        }
    }

    /// Returns the wrapped value if this is an error, `None` otherwise.
    pub fn error_value(&self) -> Option<&RpcValue> {
        match self {
            RpcValue::Error(inner) => Some(inner),
            _ => None,
        }
    }

    /// Convert a JSON value into an `RpcValue`.
    ///
    /// Integers that fit in `i32` become `I32`; other numbers become
    /// `F64`. Arrays and objects are rejected, except for the
    /// single-key `{"error": ...}` form produced by [`RpcValue::to_json`].
    pub fn from_json(json: &JsonValue) -> Result<RpcValue> {
        match json {
            JsonValue::Null => Ok(RpcValue::Null),
            JsonValue::Bool(b) => Ok(RpcValue::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if let Ok(i) = i32::try_from(i) {
                        return Ok(RpcValue::I32(i));
                    }
                }
                n.as_f64()
                    .map(RpcValue::F64)
                    .ok_or(BridgeError::ParamType { expected: "number" })
            }
            JsonValue::String(s) => Ok(RpcValue::Str(s.clone())),
            JsonValue::Object(map) if map.len() == 1 => {
                let inner = map
                    .get("error")
                    .ok_or(BridgeError::ParamType { expected: "rpc value" })?;
                Ok(RpcValue::Error(Box::new(RpcValue::from_json(inner)?)))
            }
            _ => Err(BridgeError::ParamType { expected: "rpc value" }),
        }
    }

    /// Convert this value into JSON.
    pub fn to_json(&self) -> JsonValue {
        match self {
            RpcValue::Null => JsonValue::Null,
            RpcValue::Bool(b) => JsonValue::Bool(*b),
            RpcValue::I32(i) => JsonValue::from(*i),
            RpcValue::F64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            RpcValue::Str(s) => JsonValue::String(s.clone()),
            RpcValue::Error(inner) => {
                let mut map = serde_json::Map::new();
                map.insert("error".into(), inner.to_json());
                JsonValue::Object(map)
            }
        }
    }
}
