//! Unified error handling for tandemd.
//!
//! One `thiserror` enum per layer; `anyhow` only at the binary boundary.
//! Transient delivery faults (loss, duplication, reordering) are never
//! errors; the reliable channel absorbs them silently.

use std::time::Duration;
use tandem_proto::ProtoError;
use thiserror::Error;

// ============================================================================
// Transport errors (drivers and the relay link)
// ============================================================================

/// Errors surfaced by a transport driver.
///
/// These are fatal for the link: the connection layer reports them to the
/// owning application and does not retry or reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("frame error: {0}")]
    Frame(#[from] ProtoError),
}

// ============================================================================
// Connection errors (multiplexer)
// ============================================================================

/// Errors raised by the connection/multiplexer layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Transport metadata is only carried alongside binary payloads; this is
    /// validated eagerly rather than silently coercing the payload.
    #[error("metadata requires a binary payload")]
    MetadataRequiresBinary,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Document errors
// ============================================================================

/// Errors raised by a [`crate::doc::DocumentStore`] implementation.
#[derive(Debug, Error)]
pub enum DocError {
    #[error("malformed document update: {0}")]
    MalformedUpdate(String),

    #[error("update rejected by document store: {0}")]
    Rejected(String),
}

// ============================================================================
// Session errors (host/client bootstrap)
// ============================================================================

/// Errors raised while establishing a host or client session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no host responded within {0:?}")]
    JoinTimeout(Duration),

    #[error("incompatible host version {host} (supported: {supported:?})")]
    IncompatibleHost {
        host: u32,
        supported: &'static [u32],
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Doc(#[from] DocError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_validation_error_message() {
        let err = ConnectionError::MetadataRequiresBinary;
        assert_eq!(err.to_string(), "metadata requires a binary payload");
    }

    #[test]
    fn test_proto_error_transparent() {
        let proto = ProtoError::InvalidAction("way-too-long-name".into());
        let err = ConnectionError::from(proto);
        assert!(err.to_string().contains("way-too-long-name"));
    }

    #[test]
    fn test_session_timeout_carries_duration() {
        let err = SessionError::JoinTimeout(Duration::from_secs(15));
        assert!(err.to_string().contains("15s"));
    }
}
