//! Opaque payload model for descriptor sections the core never interprets
//! (the `ui` block). Any nested JSON/TOML value round-trips through it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Variants are tried in order, so integers never collapse into floats.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpaqueValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    /// Integers above `i64::MAX`
    UInt(u64),
    Float(f64),
    String(String),
    Array(Vec<OpaqueValue>),
    Object(BTreeMap<String, OpaqueValue>),
}

impl OpaqueValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Look up a key when this value is an object.
    pub fn get(&self, key: &str) -> Option<&OpaqueValue> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}
