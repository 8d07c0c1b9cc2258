//! Document replication over the reliable `doc` channel.
//!
//! The CRDT engine is opaque to this layer: it lives behind the narrow
//! [`DocumentStore`] interface. The replicator broadcasts locally
//! originated deltas to every live peer and applies remote deltas tagged
//! with their origin, so the local change hook never re-broadcasts a
//! remotely received update. CRDT merges are commutative, so out-of-order
//! application would not corrupt the document, but the reliable channel's
//! ordering is still required so downstream consumers observing the update
//! stream see a consistent sequence.

pub mod yrs_store;

pub use yrs_store::YrsStore;

use crate::config::ProtocolConfig;
use crate::connection::Connection;
use crate::error::{ConnectionError, DocError};
use crate::reliable::ReliableChannel;
use std::fmt;
use std::sync::Arc;
use tandem_proto::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The reliable action carrying incremental document updates.
pub const DOC_ACTION: &str = "doc";

/// Where an update came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Originated by this process; eligible for broadcast.
    Local,
    /// Received from a peer; must not re-trigger the local change hook.
    Remote(PeerId),
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote(peer) => write!(f, "remote:{peer}"),
        }
    }
}

/// Callback fired with each locally originated update delta.
pub type LocalChangeHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// The narrow interface the replicator needs from a CRDT engine.
///
/// Implementations must guarantee that applying an update with a
/// [`UpdateOrigin::Remote`] origin never fires the local change handler.
pub trait DocumentStore: Send + Sync {
    /// Merge an encoded update into the document.
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), DocError>;

    /// Encode the full update history as one mergeable update.
    fn encode_update(&self) -> Vec<u8>;

    /// Encode a complete snapshot for bootstrapping a joining peer.
    fn encode_snapshot(&self) -> Vec<u8>;

    /// Install the callback fired on locally originated changes. Replaces
    /// any previous handler.
    fn set_local_change_handler(&self, handler: LocalChangeHandler);
}

/// Keeps one [`DocumentStore`] consistent across all peers of a connection.
pub struct DocReplicator {
    channel: Arc<ReliableChannel>,
    shutdown: CancellationToken,
}

impl DocReplicator {
    /// Wire `store` to the connection's `doc` channel with default timing.
    pub fn new(
        conn: &Connection,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, ConnectionError> {
        Self::with_config(conn, store, ProtocolConfig::default())
    }

    /// Wire `store` to the connection's `doc` channel.
    pub fn with_config(
        conn: &Connection,
        store: Arc<dyn DocumentStore>,
        config: ProtocolConfig,
    ) -> Result<Self, ConnectionError> {
        let channel = Arc::new(ReliableChannel::with_config(conn, DOC_ACTION, config)?);

        // Remote deltas merge into the store, tagged with their origin.
        {
            let store = Arc::clone(&store);
            channel.on_receive(move |data, from, _meta| {
                if let Err(e) = store.apply_update(data, UpdateOrigin::Remote(from.clone())) {
                    // Protocol violation from that peer; drop the one update.
                    warn!(%from, error = %e, "Dropping undecodable document update");
                }
            });
        }

        // Local deltas fan out to every live peer.
        let (delta_tx, delta_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        store.set_local_change_handler(Box::new(move |update| {
            let _ = delta_tx.send(update);
        }));

        let shutdown = CancellationToken::new();
        tokio::spawn(forward_local_deltas(
            Arc::clone(&channel),
            delta_rx,
            shutdown.clone(),
        ));

        Ok(Self { channel, shutdown })
    }

    /// The reliable channel this replicator rides on.
    #[must_use]
    pub fn channel(&self) -> &ReliableChannel {
        &self.channel
    }
}

impl Drop for DocReplicator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn forward_local_deltas(
    channel: Arc<ReliableChannel>,
    mut delta_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            delta = delta_rx.recv() => {
                let Some(delta) = delta else { break };
                if let Err(e) = channel.broadcast(delta, None).await {
                    warn!(error = %e, "Failed to broadcast document update");
                }
            }
        }
    }
}
