//! In-process transport hub with fault injection.
//!
//! Wires several drivers together the way the relay does (target
//! resolution, sender exclusion, peer-list updates on join/leave), but
//! entirely in memory, with configurable drop/duplicate/delay faults. This
//! is the backend the reliable-channel tests run against: it reproduces
//! every delivery pathology a real transport can exhibit.

use crate::error::TransportError;
use crate::transport::{TransportDriver, TransportEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tandem_proto::{Downlink, PeerId, Uplink};
use tokio::sync::mpsc;

/// Delivery fault injection plan. All faults default to off.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPlan {
    /// Probability in `[0, 1]` that a delivery is silently dropped.
    pub drop_rate: f64,
    /// Probability in `[0, 1]` that a delivery is duplicated.
    pub duplicate_rate: f64,
    /// Each delivery is delayed by a uniform random duration up to this
    /// bound, which also reorders concurrent deliveries.
    pub max_delay: Option<Duration>,
}

struct HubInner {
    peers: DashMap<PeerId, mpsc::Sender<TransportEvent>>,
    faults: Mutex<FaultPlan>,
}

/// An in-memory message hub connecting [`MemoryTransport`] drivers.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    /// Create an empty hub with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                peers: DashMap::new(),
                faults: Mutex::new(FaultPlan::default()),
            }),
        }
    }

    /// Replace the fault plan. Applies to subsequent deliveries.
    pub fn set_faults(&self, plan: FaultPlan) {
        *self.inner.faults.lock() = plan;
    }

    /// Connect a new driver under `self_id`. Every member, including the
    /// joiner, observes the updated peer list.
    pub fn connect(&self, self_id: PeerId) -> Arc<MemoryTransport> {
        let (event_tx, event_rx) = mpsc::channel(1024);
        self.inner.peers.insert(self_id.clone(), event_tx);
        self.broadcast_peers();
        Arc::new(MemoryTransport {
            self_id,
            hub: Arc::clone(&self.inner),
            events: Mutex::new(Some(event_rx)),
        })
    }

    /// Remove a peer, as if its link dropped. Remaining members observe the
    /// updated peer list; the removed peer observes `Closed`.
    pub fn disconnect(&self, peer: &PeerId) {
        if let Some((_, tx)) = self.inner.peers.remove(peer) {
            let _ = tx.try_send(TransportEvent::Closed);
            self.broadcast_peers();
        }
    }

    /// Current number of connected peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    /// Whether no peers are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    fn broadcast_peers(&self) {
        let ids: Vec<PeerId> = self.inner.peers.iter().map(|e| e.key().clone()).collect();
        for entry in self.inner.peers.iter() {
            let visible: Vec<PeerId> =
                ids.iter().filter(|id| *id != entry.key()).cloned().collect();
            let _ = entry.value().try_send(TransportEvent::Peers(visible));
        }
    }
}

fn deliver(hub: &Arc<HubInner>, from: &PeerId, uplink: Uplink) {
    let targets: Vec<PeerId> = match &uplink.target_peers {
        Some(explicit) => explicit.clone(),
        None => hub
            .peers
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| id != from)
            .collect(),
    };

    let faults = *hub.faults.lock();
    for target in targets {
        if &target == from {
            continue;
        }
        let Some(tx) = hub.peers.get(&target).map(|e| e.value().clone()) else {
            continue;
        };

        let mut rng = rand::thread_rng();
        if faults.drop_rate > 0.0 && rng.gen_bool(faults.drop_rate.min(1.0)) {
            continue;
        }
        let copies = if faults.duplicate_rate > 0.0 && rng.gen_bool(faults.duplicate_rate.min(1.0))
        {
            2
        } else {
            1
        };

        for _ in 0..copies {
            let down = Downlink {
                action: uplink.action.clone(),
                data: uplink.data.clone(),
                peer_id: from.clone(),
                metadata: uplink.metadata.clone(),
            };
            match faults.max_delay {
                Some(max) if !max.is_zero() => {
                    let delay = rng.gen_range(Duration::ZERO..max);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(TransportEvent::Message(down)).await;
                    });
                }
                _ => {
                    let _ = tx.try_send(TransportEvent::Message(down));
                }
            }
        }
    }
}

/// A driver attached to a [`MemoryHub`].
pub struct MemoryTransport {
    self_id: PeerId,
    hub: Arc<HubInner>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

#[async_trait]
impl TransportDriver for MemoryTransport {
    fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    async fn ready(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, uplink: Uplink) -> Result<(), TransportError> {
        if !self.hub.peers.contains_key(&self.self_id) {
            return Err(TransportError::Closed);
        }
        deliver(&self.hub, &self.self_id, uplink);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }
}
