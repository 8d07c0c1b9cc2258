//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while validating identifiers or encoding/decoding frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// An action name failed validation.
    #[error("invalid action name: {0}")]
    InvalidAction(String),

    /// A peer or room identifier failed validation.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A binary frame was shorter than its declared header length.
    #[error("truncated frame: need {need} header bytes, have {have}")]
    Truncated {
        /// Header bytes the length prefix promised.
        need: usize,
        /// Bytes actually present after the prefix.
        have: usize,
    },

    /// The JSON header blob of a frame could not be parsed.
    #[error("malformed frame header: {0}")]
    MalformedHeader(#[from] serde_json::Error),

    /// A frame was neither a binary pack nor a JSON text frame.
    #[error("unrecognized frame encoding")]
    UnrecognizedFrame,
}
