use thiserror::Error;

/// Errors returned by envelope and body codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON serialization/deserialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Frame-level validation failure.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
}
