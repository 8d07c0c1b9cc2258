//! Reliable-channel control headers and reserved action names.
//!
//! Reliable channels ride on ordinary messages: the control header travels
//! in the frame's `metadata` field, which keeps the payload opaque to the
//! relay and every transport backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved action for round-trip-time probes.
pub const PING_ACTION: &str = "__ping__";

/// Reserved action for round-trip-time probe replies.
pub const PONG_ACTION: &str = "__pong__";

/// Reserved relay-level action carrying the room's current peer-id list.
///
/// This name is relay wire vocabulary, not an application action: it is
/// intercepted by transport backends and never reaches subscribers.
pub const UPDATE_PEERS_ACTION: &str = "__update_peers__";

/// The control header attached to every frame on a reliable action.
///
/// `sid` is the sending channel's session nonce: a receiver holding state
/// under a different nonce for the same peer discards that state and starts
/// a fresh sequence space, and a sender ignores acks carrying a nonce other
/// than its own. This is what makes rejoin-under-the-same-peer-id safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ctrl", rename_all = "lowercase")]
pub enum ControlMeta {
    /// A sequenced data frame.
    Data {
        /// Per-(peer, action) sequence number, starting at 1.
        gsn: u64,
        /// The sender's channel session nonce.
        sid: String,
        /// Caller-supplied metadata forwarded to the receiving handler.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    /// A (possibly coalesced) acknowledgment.
    Ack {
        /// Highest contiguously-applied gsn.
        applied: u64,
        /// Gsns buffered out of order behind a gap; received, not applied.
        received: Vec<u64>,
        /// The sender session this ack acknowledges.
        sid: String,
    },
}

impl ControlMeta {
    /// Serialize into a metadata JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        // Serialization of this enum cannot fail: no non-string keys, no
        // non-serializable types.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse a control header out of a frame's metadata, if present and
    /// well-formed.
    #[must_use]
    pub fn from_metadata(metadata: Option<&Value>) -> Option<Self> {
        serde_json::from_value(metadata?.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_header_roundtrip() {
        let meta = ControlMeta::Data {
            gsn: 42,
            sid: "abc".into(),
            meta: Some(json!({"kind": "edit"})),
        };
        let value = meta.to_value();
        assert_eq!(value["ctrl"], "data");
        assert_eq!(value["gsn"], 42);
        let back = ControlMeta::from_metadata(Some(&value)).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_ack_header_roundtrip() {
        let meta = ControlMeta::Ack {
            applied: 3,
            received: vec![5, 6],
            sid: "abc".into(),
        };
        let value = meta.to_value();
        assert_eq!(value["ctrl"], "ack");
        assert_eq!(value["received"], json!([5, 6]));
        let back = ControlMeta::from_metadata(Some(&value)).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_data_header_omits_absent_user_meta() {
        let meta = ControlMeta::Data {
            gsn: 1,
            sid: "s".into(),
            meta: None,
        };
        assert!(meta.to_value().get("meta").is_none());
    }

    #[test]
    fn test_from_metadata_rejects_garbage() {
        assert!(ControlMeta::from_metadata(None).is_none());
        assert!(ControlMeta::from_metadata(Some(&json!({"ctrl": "bogus"}))).is_none());
        assert!(ControlMeta::from_metadata(Some(&json!("not an object"))).is_none());
    }
}
