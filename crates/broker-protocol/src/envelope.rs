//! The wire message envelope: `{snapshot, version, data}`.

use serde::{Deserialize, Serialize};

/// Errors surfaced while decoding a wire envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope data field is empty or missing")]
    DecodeEmptyData,
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One frame: a full snapshot or an RFC-6902 patch array, labelled with a
/// monotonic, hex-encoded version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub snapshot: bool,
    pub version: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(snapshot: bool, version: i64, data: serde_json::Value) -> Self {
        Envelope {
            snapshot,
            version: version_to_hex(version),
            data,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a raw hex version string into its numeric tick, 0 on failure.
    pub fn version_tick(&self) -> i64 {
        version_from_hex(&self.version)
    }
}

pub fn version_to_hex(version: i64) -> String {
    format!("{version:x}")
}

pub fn version_from_hex(hex: &str) -> i64 {
    i64::from_str_radix(hex, 16).unwrap_or(0)
}

/// Decode raw envelope bytes, rejecting an empty/missing `data` field.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.data.is_null() {
        return Err(EnvelopeError::DecodeEmptyData);
    }
    Ok(envelope)
}
