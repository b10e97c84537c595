//! Small serde helpers shared by the SQLite checkpointer's save/load paths.
//!
//! Centralizing these means every query site reports the same
//! [`CheckpointerError::Backend`] shape with a field name attached, instead
//! of each call site hand-rolling its own `map_err`.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::checkpointer::{CheckpointerError, Result};

/// Serializes a value to a JSON string for storage in a TEXT column.
pub fn serialize_json<T: Serialize>(value: &T, field: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CheckpointerError::Backend {
        message: format!("failed to serialize {field}: {e}"),
    })
}

/// Deserializes a JSON string column into a typed value.
pub fn deserialize_json<T: DeserializeOwned>(payload: &str, field: &'static str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| CheckpointerError::Backend {
        message: format!("failed to deserialize {field}: {e}"),
    })
}

/// Converts a `serde_json::Value` into a concrete type, reporting the offending field.
pub fn deserialize_json_value<T: DeserializeOwned>(
    value: serde_json::Value,
    field: &'static str,
) -> Result<T> {
    serde_json::from_value(value).map_err(|e| CheckpointerError::Backend {
        message: format!("failed to convert {field}: {e}"),
    })
}

/// Unwraps a `NULL`-able TEXT column, producing a clear error when absent.
pub fn require_json_field(value: Option<String>, column: &'static str) -> Result<String> {
    value.ok_or_else(|| CheckpointerError::Backend {
        message: format!("missing required column: {column}"),
    })
}
