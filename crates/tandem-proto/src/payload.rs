//! The payload union carried by every message.

use bytes::Bytes;
use serde_json::Value;

/// A message payload: either raw bytes or a JSON value.
///
/// Binary payloads travel out-of-band of the frame's JSON header (see
/// [`crate::frame`]); JSON payloads are embedded in a text frame. Transport
/// metadata is only supported alongside binary payloads, which the
/// connection layer validates eagerly rather than silently coercing.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw bytes, sent as a binary frame.
    Binary(Bytes),
    /// A JSON value, sent as a text frame.
    Json(Value),
}

impl Payload {
    /// Whether this payload is binary.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Borrow the binary payload, if any.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            Self::Json(_) => None,
        }
    }

    /// Borrow the JSON payload, if any.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Binary(_) => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_accessors() {
        let bin = Payload::from(vec![1u8, 2, 3]);
        assert!(bin.is_binary());
        assert_eq!(bin.as_bytes().unwrap().as_ref(), &[1, 2, 3]);
        assert!(bin.as_json().is_none());

        let json = Payload::from(json!({"k": 1}));
        assert!(!json.is_binary());
        assert!(json.as_bytes().is_none());
        assert_eq!(json.as_json().unwrap()["k"], 1);
    }
}
