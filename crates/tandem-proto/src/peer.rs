//! Peer and room identifiers.

use crate::error::ProtoError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters used for generated identifiers.
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated peer identifiers.
const GENERATED_ID_LEN: usize = 10;

/// Maximum accepted identifier length on the wire.
const MAX_ID_LEN: usize = 64;

fn valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// An opaque peer identifier, stable for a connection's lifetime.
///
/// A connection's live peer set never contains its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a peer id received from the wire.
    pub fn parse(id: impl Into<String>) -> Result<Self, ProtoError> {
        let id = id.into();
        if valid_id(&id) {
            Ok(Self(id))
        } else {
            Err(ProtoError::InvalidId(id))
        }
    }

    /// Generate a fresh random peer id.
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..GENERATED_ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Get the inner id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A room identifier scoping a set of peers on a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room id.
    pub fn parse(id: impl Into<String>) -> Result<Self, ProtoError> {
        let id = id.into();
        if valid_id(&id) {
            Ok(Self(id))
        } else {
            Err(ProtoError::InvalidId(id))
        }
    }

    /// Get the inner id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_parse_valid() {
        let id = PeerId::parse("abc-123_X").unwrap();
        assert_eq!(id.as_str(), "abc-123_X");
    }

    #[test]
    fn test_peer_id_parse_rejects_bad_chars() {
        assert!(PeerId::parse("has space").is_err());
        assert!(PeerId::parse("slash/es").is_err());
        assert!(PeerId::parse("").is_err());
    }

    #[test]
    fn test_peer_id_parse_rejects_oversized() {
        let long = "x".repeat(65);
        assert!(PeerId::parse(long).is_err());
    }

    #[test]
    fn test_peer_id_random_is_valid() {
        let id = PeerId::random();
        assert_eq!(id.as_str().len(), 10);
        assert!(PeerId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn test_peer_id_random_unique() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_room_id_roundtrips_serde() {
        let room = RoomId::parse("room-1").unwrap();
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, "\"room-1\"");
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, room);
    }
}
