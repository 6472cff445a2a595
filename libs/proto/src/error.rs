//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Errors that can occur when encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The payload is not a valid message.
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The message could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
}
