//! Runtime value model and type registry.
//!
//! Collection key/value types are declared inside the chain (one declaration
//! per collection), not at compile time. The registry maps those declared
//! type names to encode/decode codecs. Built-ins cover the primitives;
//! callers register codecs for their own types on the
//! [`EngineConfig`](crate::engine::EngineConfig). An unregistered type is
//! valid: its values surface losslessly as [`Value::Opaque`] and can be
//! written back unchanged.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A decoded collection key or value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// A value whose declared type has no registered codec (or failed to
    /// decode). The raw bytes round-trip through backups unchanged.
    Opaque { type_name: String, bytes: Vec<u8> },
}

impl Value {
    /// The type name this value encodes under.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Bool(_) => "bool",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Opaque { type_name, .. } => type_name,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

type DecodeFn = dyn Fn(&[u8]) -> Result<Value> + Send + Sync;
type EncodeFn = dyn Fn(&Value) -> Result<Vec<u8>> + Send + Sync;

/// Encode/decode pair for one declared type name.
#[derive(Clone)]
pub struct ValueCodec {
    decode: Arc<DecodeFn>,
    encode: Arc<EncodeFn>,
}

impl ValueCodec {
    pub fn new(
        decode: impl Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
        encode: impl Fn(&Value) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            decode: Arc::new(decode),
            encode: Arc::new(encode),
        }
    }
}

/// Maps declared type names to codecs.
#[derive(Clone)]
pub struct TypeRegistry {
    codecs: HashMap<String, ValueCodec>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_primitives()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.codecs.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        f.debug_tuple("TypeRegistry").field(&names).finish()
    }
}

impl TypeRegistry {
    /// Registry with no codecs at all; every value surfaces as opaque.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in primitive codecs.
    ///
    /// Primitives encode as MessagePack except `bytes`, which is raw
    /// passthrough.
    pub fn with_primitives() -> Self {
        let mut registry = Self::empty();

        registry.register(
            "bool",
            ValueCodec::new(
                |bytes| Ok(Value::Bool(rmp_serde::from_slice(bytes)?)),
                |value| match value {
                    Value::Bool(b) => Ok(rmp_serde::to_vec(b)?),
                    other => Err(variant_mismatch("bool", other)),
                },
            ),
        );
        registry.register(
            "i64",
            ValueCodec::new(
                |bytes| Ok(Value::I64(rmp_serde::from_slice(bytes)?)),
                |value| match value {
                    Value::I64(n) => Ok(rmp_serde::to_vec(n)?),
                    other => Err(variant_mismatch("i64", other)),
                },
            ),
        );
        registry.register(
            "u64",
            ValueCodec::new(
                |bytes| Ok(Value::U64(rmp_serde::from_slice(bytes)?)),
                |value| match value {
                    Value::U64(n) => Ok(rmp_serde::to_vec(n)?),
                    other => Err(variant_mismatch("u64", other)),
                },
            ),
        );
        registry.register(
            "f64",
            ValueCodec::new(
                |bytes| Ok(Value::F64(rmp_serde::from_slice(bytes)?)),
                |value| match value {
                    Value::F64(n) => Ok(rmp_serde::to_vec(n)?),
                    other => Err(variant_mismatch("f64", other)),
                },
            ),
        );
        registry.register(
            "string",
            ValueCodec::new(
                |bytes| Ok(Value::Str(rmp_serde::from_slice(bytes)?)),
                |value| match value {
                    Value::Str(s) => Ok(rmp_serde::to_vec(s)?),
                    other => Err(variant_mismatch("string", other)),
                },
            ),
        );
        registry.register(
            "bytes",
            ValueCodec::new(
                |bytes| Ok(Value::Bytes(bytes.to_vec())),
                |value| match value {
                    Value::Bytes(b) => Ok(b.clone()),
                    other => Err(variant_mismatch("bytes", other)),
                },
            ),
        );
        registry.register(
            "json",
            ValueCodec::new(
                |bytes| {
                    let json: serde_json::Value = rmp_serde::from_slice(bytes)?;
                    Ok(Value::Json(json))
                },
                |value| match value {
                    Value::Json(v) => Ok(rmp_serde::to_vec(v)?),
                    other => Err(variant_mismatch("json", other)),
                },
            ),
        );

        registry
    }

    /// Register (or replace) the codec for a type name.
    pub fn register(&mut self, name: impl Into<String>, codec: ValueCodec) {
        self.codecs.insert(name.into(), codec);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.codecs.contains_key(name)
    }

    /// Decode bytes declared as `type_name`.
    ///
    /// Never fails: an unregistered type or a decode error degrades to
    /// [`Value::Opaque`] so replay is not aborted by a value problem.
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Value {
        match self.codecs.get(type_name) {
            Some(codec) => match (codec.decode)(bytes) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(
                        type_name,
                        error = %e,
                        "value failed to decode, surfacing as opaque"
                    );
                    Value::Opaque {
                        type_name: type_name.to_string(),
                        bytes: bytes.to_vec(),
                    }
                }
            },
            None => Value::Opaque {
                type_name: type_name.to_string(),
                bytes: bytes.to_vec(),
            },
        }
    }

    /// Encode a value for a collection whose declared type is `type_name`.
    ///
    /// Opaque values pass through when their recorded type matches the
    /// declared one, so an unregistered type can still be written back.
    pub fn encode(&self, type_name: &str, value: &Value) -> Result<Vec<u8>> {
        if let Value::Opaque {
            type_name: recorded,
            bytes,
        } = value
        {
            if recorded == type_name {
                return Ok(bytes.clone());
            }
        }

        match self.codecs.get(type_name) {
            Some(codec) => (codec.encode)(value),
            None => Err(EngineError::Serialization(format!(
                "no codec registered for type '{}'",
                type_name
            ))),
        }
    }
}

fn variant_mismatch(expected: &str, got: &Value) -> EngineError {
    EngineError::Serialization(format!(
        "expected a {} value, got {}",
        expected,
        got.type_name()
    ))
}
