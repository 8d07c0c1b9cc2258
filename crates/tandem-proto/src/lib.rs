//! # tandem-proto
//!
//! Wire-level protocol types for the Tandem reliable peer messaging
//! transport and replicated document synchronization.
//!
//! This crate is pure data: identifiers, the payload union, frame
//! encoding/decoding, and the reliable-channel control header. It has no
//! async runtime dependencies, so it can be shared between the relay
//! daemon, transport backends, and tests.
//!
//! ## Framing
//!
//! Messages with a binary payload are packed as a 4-byte little-endian
//! length prefix for a UTF-8 JSON header blob, followed immediately by the
//! raw payload bytes. Textual-only messages are plain JSON text frames.
//! See [`frame`] for details.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod action;
pub mod control;
pub mod error;
pub mod frame;
pub mod payload;
pub mod peer;

pub use self::action::{Action, MAX_ACTION_LEN};
pub use self::control::{ControlMeta, PING_ACTION, PONG_ACTION, UPDATE_PEERS_ACTION};
pub use self::error::ProtoError;
pub use self::frame::{Downlink, Uplink, WireFrame};
pub use self::payload::Payload;
pub use self::peer::{PeerId, RoomId};
