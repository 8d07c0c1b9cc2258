//! Uplink/downlink message frames and their wire encoding.
//!
//! A frame with a binary payload is packed as:
//!
//! ```text
//! ┌───────────────┬─────────────────────┬───────────────┐
//! │ header length │ JSON header (UTF-8) │ payload bytes │
//! │ 4 bytes, LE   │ variable            │ variable      │
//! └───────────────┴─────────────────────┴───────────────┘
//! ```
//!
//! A frame with a JSON payload is sent as a plain JSON text frame with the
//! payload embedded under `data`. Header keys are camelCase on the wire.

use crate::error::ProtoError;
use crate::payload::Payload;
use crate::peer::PeerId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An encoded frame ready for a transport: binary pack or JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// Length-prefixed header + raw payload bytes.
    Binary(Bytes),
    /// A JSON text frame.
    Text(String),
}

/// A client-to-relay message.
#[derive(Debug, Clone, PartialEq)]
pub struct Uplink {
    /// Target action name.
    pub action: String,
    /// Message payload.
    pub data: Payload,
    /// Explicit target peers; `None` broadcasts to the whole room.
    pub target_peers: Option<Vec<PeerId>>,
    /// Optional transport metadata (binary payloads only).
    pub metadata: Option<Value>,
}

/// A relay-to-client message, annotated with the sender's id.
#[derive(Debug, Clone, PartialEq)]
pub struct Downlink {
    /// Target action name.
    pub action: String,
    /// Message payload.
    pub data: Payload,
    /// The peer that sent the uplink this was relayed from.
    pub peer_id: PeerId,
    /// Optional transport metadata, relayed verbatim.
    pub metadata: Option<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UplinkHeader {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_peers: Option<Vec<PeerId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownlinkHeader {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

fn pack(header: &[u8], payload: &[u8]) -> Bytes {
    let mut packed = BytesMut::with_capacity(4 + header.len() + payload.len());
    packed.put_u32_le(header.len() as u32);
    packed.put_slice(header);
    packed.put_slice(payload);
    packed.freeze()
}

fn unpack(mut frame: Bytes) -> Result<(Bytes, Bytes), ProtoError> {
    if frame.len() < 4 {
        return Err(ProtoError::Truncated {
            need: 4,
            have: frame.len(),
        });
    }
    let header_len = frame.get_u32_le() as usize;
    if frame.len() < header_len {
        return Err(ProtoError::Truncated {
            need: header_len,
            have: frame.len(),
        });
    }
    let header = frame.split_to(header_len);
    Ok((header, frame))
}

impl Uplink {
    /// Encode into a wire frame; binary payloads pack, JSON payloads become
    /// text frames.
    pub fn encode(&self) -> Result<WireFrame, ProtoError> {
        match &self.data {
            Payload::Binary(payload) => {
                let header = serde_json::to_vec(&UplinkHeader {
                    action: self.action.clone(),
                    data: None,
                    target_peers: self.target_peers.clone(),
                    metadata: self.metadata.clone(),
                })?;
                Ok(WireFrame::Binary(pack(&header, payload)))
            }
            Payload::Json(value) => {
                let text = serde_json::to_string(&UplinkHeader {
                    action: self.action.clone(),
                    data: Some(value.clone()),
                    target_peers: self.target_peers.clone(),
                    metadata: self.metadata.clone(),
                })?;
                Ok(WireFrame::Text(text))
            }
        }
    }

    /// Decode from a wire frame.
    pub fn decode(frame: WireFrame) -> Result<Self, ProtoError> {
        match frame {
            WireFrame::Binary(bytes) => {
                let (header, payload) = unpack(bytes)?;
                let header: UplinkHeader = serde_json::from_slice(&header)?;
                Ok(Self {
                    action: header.action,
                    data: Payload::Binary(payload),
                    target_peers: header.target_peers,
                    metadata: header.metadata,
                })
            }
            WireFrame::Text(text) => {
                let header: UplinkHeader = serde_json::from_str(&text)?;
                Ok(Self {
                    action: header.action,
                    data: Payload::Json(header.data.unwrap_or(Value::Null)),
                    target_peers: header.target_peers,
                    metadata: header.metadata,
                })
            }
        }
    }
}

impl Downlink {
    /// Encode into a wire frame; binary payloads pack, JSON payloads become
    /// text frames.
    pub fn encode(&self) -> Result<WireFrame, ProtoError> {
        match &self.data {
            Payload::Binary(payload) => {
                let header = serde_json::to_vec(&DownlinkHeader {
                    action: self.action.clone(),
                    data: None,
                    peer_id: self.peer_id.clone(),
                    metadata: self.metadata.clone(),
                })?;
                Ok(WireFrame::Binary(pack(&header, payload)))
            }
            Payload::Json(value) => {
                let text = serde_json::to_string(&DownlinkHeader {
                    action: self.action.clone(),
                    data: Some(value.clone()),
                    peer_id: self.peer_id.clone(),
                    metadata: self.metadata.clone(),
                })?;
                Ok(WireFrame::Text(text))
            }
        }
    }

    /// Decode from a wire frame.
    pub fn decode(frame: WireFrame) -> Result<Self, ProtoError> {
        match frame {
            WireFrame::Binary(bytes) => {
                let (header, payload) = unpack(bytes)?;
                let header: DownlinkHeader = serde_json::from_slice(&header)?;
                Ok(Self {
                    action: header.action,
                    data: Payload::Binary(payload),
                    peer_id: header.peer_id,
                    metadata: header.metadata,
                })
            }
            WireFrame::Text(text) => {
                let header: DownlinkHeader = serde_json::from_str(&text)?;
                Ok(Self {
                    action: header.action,
                    data: Payload::Json(header.data.unwrap_or(Value::Null)),
                    peer_id: header.peer_id,
                    metadata: header.metadata,
                })
            }
        }
    }
}
