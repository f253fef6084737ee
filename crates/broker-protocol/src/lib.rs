//! Key/glob grammar and wire types shared between the broker core and its
//! HTTP/WS façade.

pub mod envelope;
pub mod object;
pub mod path;

pub use envelope::{decode_envelope, Envelope, EnvelopeError};
pub use object::Object;
pub use path::PathError;

/// HTTP error envelope used by non-2xx REST responses.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
