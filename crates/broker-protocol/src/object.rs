//! The immutable record envelope stored at a key, and its canonical JSON
//! encoding.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Immutable envelope around one record. `created == 0` marks an unset or
/// deleted object; deletion resets a slot to `Object::empty()` rather than
/// tombstoning it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub created: i64,
    pub updated: i64,
    pub index: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub data: serde_json::Value,
}

impl Default for Object {
    fn default() -> Self {
        Self::empty()
    }
}

impl Object {
    /// The canonical "nothing here" object: `{"created":0,"updated":0,"index":"","data":{}}`.
    pub fn empty() -> Self {
        Object {
            created: 0,
            updated: 0,
            index: String::new(),
            path: String::new(),
            data: json!({}),
        }
    }

    /// True for the unset/deleted sentinel (`created == 0`).
    pub fn is_empty(&self) -> bool {
        self.created == 0
    }

    /// Canonical JSON encoding (keys sorted, stable across calls) used both
    /// on the wire and as the pre/post state fed to patch derivation.
    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Encode a list of objects, preserving order, for glob-pool snapshots.
pub fn encode_list(objects: &[Object]) -> serde_json::Value {
    serde_json::Value::Array(objects.iter().map(Object::encode).collect())
}
