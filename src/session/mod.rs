//! Host and client session bootstrap.
//!
//! The holder of current state (the host) sends a complete snapshot to each
//! joining peer exactly once, on the dedicated `init` action, out of band
//! from the ongoing incremental stream. Clients wait for that snapshot,
//! gate on the host's protocol version, merge it, and from then on converge
//! through the replicator.

use crate::config::ProtocolConfig;
use crate::connection::{Connection, PeerEvent, Target};
use crate::doc::{DocReplicator, DocumentStore, UpdateOrigin};
use crate::error::SessionError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tandem_proto::PeerId;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The action carrying the one-shot bootstrap snapshot.
pub const INIT_ACTION: &str = "init";

/// Protocol version stamped on snapshots by this build.
pub const HOST_VERSION: u32 = 1;

/// Host versions this build can join.
pub const SUPPORTED_HOST_VERSIONS: &[u32] = &[1];

/// Host identity sent alongside the bootstrap snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMeta {
    /// The host's protocol version.
    pub version: u32,
    /// The host's operating system, for display.
    pub os: String,
}

impl HostMeta {
    /// The metadata this build advertises.
    #[must_use]
    pub fn current() -> Self {
        Self {
            version: HOST_VERSION,
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// The hosting side of a shared document session.
pub struct HostSession {
    replicator: DocReplicator,
    shutdown: CancellationToken,
}

impl HostSession {
    /// Start hosting with default timing.
    pub fn start(
        conn: &Connection,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, SessionError> {
        Self::with_config(conn, store, ProtocolConfig::default())
    }

    /// Start hosting: replicate the store and snapshot every joiner.
    pub fn with_config(
        conn: &Connection,
        store: Arc<dyn DocumentStore>,
        config: ProtocolConfig,
    ) -> Result<Self, SessionError> {
        let replicator = DocReplicator::with_config(conn, Arc::clone(&store), config)?;
        let init = conn.action(INIT_ACTION).map_err(SessionError::Connection)?;

        // Subscribe before snapshotting the current set so a join between
        // the two is not missed; the sent-set dedupes the overlap.
        let events = conn.peer_events();
        let present = conn.live_peers();
        let shutdown = CancellationToken::new();
        tokio::spawn(snapshot_joiners(
            init,
            store,
            events,
            present,
            shutdown.clone(),
        ));

        Ok(Self {
            replicator,
            shutdown,
        })
    }

    /// The replicator backing this session.
    #[must_use]
    pub fn replicator(&self) -> &DocReplicator {
        &self.replicator
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn snapshot_joiners(
    init: crate::connection::ActionHandle,
    store: Arc<dyn DocumentStore>,
    mut events: broadcast::Receiver<PeerEvent>,
    present: Vec<PeerId>,
    shutdown: CancellationToken,
) {
    let meta = serde_json::to_value(HostMeta::current()).unwrap_or(Value::Null);
    let mut sent: HashSet<PeerId> = HashSet::new();

    for peer in present {
        send_snapshot(&init, &store, &meta, &peer, &mut sent).await;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(PeerEvent::Joined(peer)) => {
                    send_snapshot(&init, &store, &meta, &peer, &mut sent).await;
                }
                Ok(PeerEvent::Left(peer)) => {
                    // A rejoin gets a fresh snapshot.
                    sent.remove(&peer);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn send_snapshot(
    init: &crate::connection::ActionHandle,
    store: &Arc<dyn DocumentStore>,
    meta: &Value,
    peer: &PeerId,
    sent: &mut HashSet<PeerId>,
) {
    if !sent.insert(peer.clone()) {
        return;
    }
    let snapshot = store.encode_snapshot();
    info!(%peer, bytes = snapshot.len(), "Sending bootstrap snapshot");
    if let Err(e) = init
        .send(snapshot, Target::Peer(peer.clone()), Some(meta.clone()))
        .await
    {
        warn!(%peer, error = %e, "Failed to send bootstrap snapshot");
        sent.remove(peer);
    }
}

/// The joining side of a shared document session.
pub struct ClientSession {
    host_id: PeerId,
    host_meta: HostMeta,
    replicator: DocReplicator,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("host_id", &self.host_id)
            .field("host_meta", &self.host_meta)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Join with default timing.
    pub async fn join(
        conn: &Connection,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, SessionError> {
        Self::with_config(conn, store, ProtocolConfig::default()).await
    }

    /// Wait for the host's snapshot, gate on its version, merge it, and
    /// start replicating.
    pub async fn with_config(
        conn: &Connection,
        store: Arc<dyn DocumentStore>,
        config: ProtocolConfig,
    ) -> Result<Self, SessionError> {
        let init = conn.action(INIT_ACTION).map_err(SessionError::Connection)?;

        type InitPayload = (bytes::Bytes, PeerId, Option<HostMeta>);
        let (init_tx, init_rx) = oneshot::channel::<InitPayload>();
        let slot = Arc::new(Mutex::new(Some(init_tx)));
        init.on_receive(move |data, from, meta| {
            let Some(bytes) = data.as_bytes() else {
                warn!(%from, "Dropping non-binary init frame");
                return;
            };
            let host_meta = meta.and_then(|m| serde_json::from_value(m.clone()).ok());
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send((bytes.clone(), from.clone(), host_meta));
            }
        });

        let timeout = config.join_timeout();
        let (snapshot, host_id, host_meta) = tokio::time::timeout(timeout, init_rx)
            .await
            .map_err(|_| SessionError::JoinTimeout(timeout))?
            .map_err(|_| SessionError::JoinTimeout(timeout))?;

        let host_meta = host_meta.unwrap_or(HostMeta {
            version: 0,
            os: String::new(),
        });
        if !SUPPORTED_HOST_VERSIONS.contains(&host_meta.version) {
            return Err(SessionError::IncompatibleHost {
                host: host_meta.version,
                supported: SUPPORTED_HOST_VERSIONS,
            });
        }

        // Replicate first, then merge the snapshot: deltas racing ahead of
        // it merge cleanly either way because the CRDT is commutative.
        let replicator = DocReplicator::with_config(conn, Arc::clone(&store), config)?;
        store.apply_update(&snapshot, UpdateOrigin::Remote(host_id.clone()))?;
        info!(host = %host_id, version = host_meta.version, "Joined session");

        Ok(Self {
            host_id,
            host_meta,
            replicator,
        })
    }

    /// The peer that sent our snapshot.
    #[must_use]
    pub fn host_id(&self) -> &PeerId {
        &self.host_id
    }

    /// The host's advertised metadata.
    #[must_use]
    pub fn host_meta(&self) -> &HostMeta {
        &self.host_meta
    }

    /// The replicator backing this session.
    #[must_use]
    pub fn replicator(&self) -> &DocReplicator {
        &self.replicator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_meta_current_is_supported() {
        let meta = HostMeta::current();
        assert!(SUPPORTED_HOST_VERSIONS.contains(&meta.version));
        assert!(!meta.os.is_empty());
    }

    #[test]
    fn test_host_meta_serde_roundtrip() {
        let meta = HostMeta::current();
        let value = serde_json::to_value(&meta).unwrap();
        let back: HostMeta = serde_json::from_value(value).unwrap();
        assert_eq!(back.version, meta.version);
        assert_eq!(back.os, meta.os);
    }
}
