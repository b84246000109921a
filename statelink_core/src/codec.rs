//! Field bag codec.
//!
//! A value is flattened into one entry per top-level field, each entry
//! holding that field's JSON text. This keeps the wire format a plain
//! string map while still reconstructing typed commands exactly.

use crate::error::FieldError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use statelink_env::FieldBag;

/// Flattens a struct into a field bag.
pub fn encode_fields<T: Serialize>(value: &T) -> Result<FieldBag, FieldError> {
    match serde_json::to_value(value).map_err(|e| FieldError::Decode(e.to_string()))? {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect()),
        other => Err(FieldError::NotAStruct(other.to_string())),
    }
}

/// Rebuilds a struct from a field bag.
pub fn decode_fields<T: DeserializeOwned>(fields: &FieldBag) -> Result<T, FieldError> {
    let mut map = Map::new();
    for (key, text) in fields {
        let value: Value = serde_json::from_str(text).map_err(|e| FieldError::Malformed {
            field: key.clone(),
            reason: e.to_string(),
        })?;
        map.insert(key.clone(), value);
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| FieldError::Decode(e.to_string()))
}

/// Reads a single typed field without decoding the whole bag.
pub fn read_field<T: DeserializeOwned>(fields: &FieldBag, key: &str) -> Result<T, FieldError> {
    let text = fields
        .get(key)
        .ok_or_else(|| FieldError::Missing(key.to_string()))?;
    serde_json::from_str(text).map_err(|e| FieldError::Malformed {
        field: key.to_string(),
        reason: e.to_string(),
    })
}
