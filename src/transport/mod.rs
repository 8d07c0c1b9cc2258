//! Transport drivers: the contract between the connection layer and a
//! concrete backend.
//!
//! A driver provides at-least-once, unordered, duplicate-prone delivery and
//! nothing more. Ordering and exactly-once application are built on top by
//! [`crate::reliable`]. Two backends live here: [`ws::WsTransport`] speaks
//! the relay protocol over a websocket, and [`memory::MemoryHub`] wires
//! processes together in-memory with optional fault injection for tests.

pub mod memory;
pub mod ws;

use crate::error::TransportError;
use async_trait::async_trait;
use tandem_proto::{Downlink, PeerId, Uplink};
use tokio::sync::mpsc;

/// Events emitted by a transport driver.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message arrived for this peer.
    Message(Downlink),
    /// The reachable peer set changed. Never contains self.
    Peers(Vec<PeerId>),
    /// A transport-level error. The link may still close afterwards.
    Error(String),
    /// The link is gone. Terminal; no further events follow.
    Closed,
}

/// A transport backend.
///
/// Implementations deliver with at-least-once semantics and may duplicate,
/// drop, reorder, or delay arbitrarily. They do not retry or reconnect:
/// fatal errors surface as [`TransportEvent::Error`]/[`TransportEvent::Closed`]
/// and recovery policy belongs to the owning application.
#[async_trait]
pub trait TransportDriver: Send + Sync + 'static {
    /// This peer's id, stable for the connection's lifetime.
    fn self_id(&self) -> &PeerId;

    /// Resolves once the driver is ready to carry traffic.
    async fn ready(&self) -> Result<(), TransportError>;

    /// Hand a message to the transport. Resolves on handoff, not delivery.
    async fn send(&self, uplink: Uplink) -> Result<(), TransportError>;

    /// Take the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}
