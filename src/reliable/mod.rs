//! Reliable channel controller.
//!
//! Turns an action's unordered, duplicating, lossy delivery into ordered,
//! exactly-once-applied delivery per (sender, receiver) pair. Sequence
//! numbers (gsn) are assigned per target at send time; receivers buffer
//! out-of-order arrivals and drain strictly in gsn order; acks carry the
//! applied cursor plus the gsns parked behind a gap so the far side stops
//! resending them. Retransmission is a fixed-timeout sweep with no
//! exponential backoff; peer counts and message sizes here are small.
//!
//! Actions not opted into reliability bypass all of this: delivered
//! immediately, unordered, possibly duplicated.

use crate::config::ProtocolConfig;
use crate::connection::{ActionHandle, Connection, PeerEvent, Target};
use crate::error::ConnectionError;
use crate::metrics;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tandem_proto::{Action, ControlMeta, Payload, PeerId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A subscriber to in-order, exactly-once message delivery.
pub type ReliableHandler = Arc<dyn Fn(&Bytes, &PeerId, Option<&Value>) + Send + Sync>;

struct OutstandingEntry {
    payload: Bytes,
    metadata: Option<Value>,
    sent_at: Instant,
}

struct BufferedEntry {
    payload: Bytes,
    metadata: Option<Value>,
}

/// Per-peer channel state: the sender half toward the peer and the receiver
/// half from it. Owned exclusively by one controller, keyed by peer id; the
/// action is fixed per controller instance.
struct PeerChannelState {
    // Sender half.
    next_gsn: u64,
    outstanding: BTreeMap<u64, OutstandingEntry>,
    // Receiver half.
    remote_session: Option<String>,
    last_applied: u64,
    buffer: BTreeMap<u64, BufferedEntry>,
    last_seen: Instant,
    suspended_at: Option<Instant>,
    ack_pending: bool,
}

impl PeerChannelState {
    fn new() -> Self {
        Self {
            next_gsn: 1,
            outstanding: BTreeMap::new(),
            remote_session: None,
            last_applied: 0,
            buffer: BTreeMap::new(),
            last_seen: Instant::now(),
            suspended_at: None,
            ack_pending: false,
        }
    }
}

struct Applied {
    from: PeerId,
    payload: Bytes,
    metadata: Option<Value>,
}

struct ChannelInner {
    handle: ActionHandle,
    session: String,
    config: ProtocolConfig,
    table: DashMap<PeerId, Mutex<PeerChannelState>>,
    handlers: RwLock<Vec<ReliableHandler>>,
    live_peers: watch::Receiver<Vec<PeerId>>,
    apply_tx: mpsc::UnboundedSender<Applied>,
    shutdown: CancellationToken,
}

/// An ordered, exactly-once-applied channel over one action.
///
/// Dropping the channel cancels its sweep and applier tasks and abandons
/// all in-flight retransmissions.
pub struct ReliableChannel {
    inner: Arc<ChannelInner>,
}

impl ReliableChannel {
    /// Opt `action` into reliable delivery with default timing.
    pub fn new(conn: &Connection, action: &str) -> Result<Self, ConnectionError> {
        Self::with_config(conn, action, ProtocolConfig::default())
    }

    /// Opt `action` into reliable delivery with explicit timing knobs.
    pub fn with_config(
        conn: &Connection,
        action: &str,
        config: ProtocolConfig,
    ) -> Result<Self, ConnectionError> {
        let handle = conn.action(action)?;
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            handle: handle.clone(),
            session: Uuid::new_v4().simple().to_string(),
            config,
            table: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            live_peers: conn.peers(),
            apply_tx,
            shutdown: CancellationToken::new(),
        });

        // Intercept every frame on the action.
        let weak = Arc::downgrade(&inner);
        handle.on_receive(move |data, from, meta| {
            if let Some(inner) = weak.upgrade() {
                on_frame(&inner, data, from, meta);
            }
        });

        tokio::spawn(applier(Arc::clone(&inner), apply_rx));
        tokio::spawn(sweep(Arc::clone(&inner)));
        tokio::spawn(peer_watch(Arc::clone(&inner), conn.peer_events()));

        Ok(Self { inner })
    }

    /// The action this channel rides on.
    #[must_use]
    pub fn action(&self) -> &Action {
        self.inner.handle.action()
    }

    /// This endpoint's session nonce.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.inner.session
    }

    /// Subscribe to in-order delivery. Subscribers compose, in subscription
    /// order, on a single applier task.
    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn(&Bytes, &PeerId, Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Send to one peer: assign the next gsn toward it, transmit, and track
    /// until acknowledged.
    pub async fn send(
        &self,
        peer: &PeerId,
        data: impl Into<Bytes>,
        metadata: Option<Value>,
    ) -> Result<(), ConnectionError> {
        let data = data.into();
        let ctrl = {
            let entry = self
                .inner
                .table
                .entry(peer.clone())
                .or_insert_with(|| Mutex::new(PeerChannelState::new()));
            let mut state = entry.lock();
            let gsn = state.next_gsn;
            state.next_gsn += 1;
            state.outstanding.insert(
                gsn,
                OutstandingEntry {
                    payload: data.clone(),
                    metadata: metadata.clone(),
                    sent_at: Instant::now(),
                },
            );
            ControlMeta::Data {
                gsn,
                sid: self.inner.session.clone(),
                meta: metadata,
            }
        };
        self.inner
            .handle
            .send(
                Payload::Binary(data),
                Target::Peer(peer.clone()),
                Some(ctrl.to_value()),
            )
            .await
    }

    /// Send to every live peer, each on its own sequence space.
    pub async fn broadcast(
        &self,
        data: impl Into<Bytes>,
        metadata: Option<Value>,
    ) -> Result<(), ConnectionError> {
        let data = data.into();
        let peers = self.inner.live_peers.borrow().clone();
        for peer in peers {
            self.send(&peer, data.clone(), metadata.clone()).await?;
        }
        Ok(())
    }

    /// Number of messages toward `peer` not yet proven received.
    #[must_use]
    pub fn outstanding_to(&self, peer: &PeerId) -> usize {
        self.inner
            .table
            .get(peer)
            .map_or(0, |e| e.lock().outstanding.len())
    }

    /// Number of messages from `peer` buffered behind a gap.
    #[must_use]
    pub fn buffered_from(&self, peer: &PeerId) -> usize {
        self.inner
            .table
            .get(peer)
            .map_or(0, |e| e.lock().buffer.len())
    }

    /// Highest contiguously-applied gsn from `peer`.
    #[must_use]
    pub fn applied_cursor(&self, peer: &PeerId) -> u64 {
        self.inner
            .table
            .get(peer)
            .map_or(0, |e| e.lock().last_applied)
    }

    /// Whether any channel state exists for `peer`.
    #[must_use]
    pub fn has_state_for(&self, peer: &PeerId) -> bool {
        self.inner.table.contains_key(peer)
    }

    /// Whether ack probing toward `peer` is currently suspended.
    #[must_use]
    pub fn probing_suspended(&self, peer: &PeerId) -> bool {
        self.inner
            .table
            .get(peer)
            .is_some_and(|e| e.lock().suspended_at.is_some())
    }

    /// Cancel the channel's tasks without waiting for drop.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for ReliableChannel {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn on_frame(inner: &Arc<ChannelInner>, data: &Payload, from: &PeerId, metadata: Option<&Value>) {
    let Some(ctrl) = ControlMeta::from_metadata(metadata) else {
        // Protocol violation: drop the single offending message.
        warn!(
            action = %inner.handle.action(),
            %from,
            "Dropping frame without a control header on a reliable action"
        );
        return;
    };
    match ctrl {
        ControlMeta::Data { gsn, sid, meta } => on_data(inner, from, data, gsn, sid, meta),
        ControlMeta::Ack { applied, received, sid } => {
            inner.on_ack(from, applied, &received, &sid);
        }
    }
}

fn on_data(
    inner: &Arc<ChannelInner>,
    from: &PeerId,
    payload: &Payload,
    gsn: u64,
    sid: String,
    meta: Option<Value>,
) {
    let Some(bytes) = payload.as_bytes() else {
        warn!(action = %inner.handle.action(), %from, "Dropping non-binary reliable frame");
        return;
    };

    let entry = inner
        .table
        .entry(from.clone())
        .or_insert_with(|| Mutex::new(PeerChannelState::new()));
    let mut state = entry.lock();

    if state.remote_session.as_deref() != Some(sid.as_str()) {
        // The peer restarted its channel under the same id: fresh
        // sequence space.
        if state.remote_session.is_some() {
            debug!(%from, "Peer session changed, resetting receive state");
        }
        state.remote_session = Some(sid);
        state.last_applied = 0;
        state.buffer.clear();
    }

    state.last_seen = Instant::now();
    state.suspended_at = None;

    if gsn <= state.last_applied {
        metrics::inc(&metrics::DUPLICATES_DISCARDED);
    } else {
        state.buffer.insert(
            gsn,
            BufferedEntry {
                payload: bytes.clone(),
                metadata: meta,
            },
        );
        // Drain strictly in order; the applier preserves this order.
        while let Some(next) = {
            let want = state.last_applied + 1;
            state.buffer.remove(&want)
        } {
            let _ = inner.apply_tx.send(Applied {
                from: from.clone(),
                payload: next.payload,
                metadata: next.metadata,
            });
            state.last_applied += 1;
        }
        if !state.buffer.is_empty() {
            debug!(
                %from,
                waiting_for = state.last_applied + 1,
                buffered = state.buffer.len(),
                "Messages parked behind a gap"
            );
        }
    }

    if !state.ack_pending {
        state.ack_pending = true;
        tokio::spawn(ack_later(Arc::downgrade(inner), from.clone()));
    }
}

impl ChannelInner {
    fn on_ack(&self, from: &PeerId, applied: u64, received: &[u64], sid: &str) {
        if sid != self.session {
            debug!(%from, "Ignoring ack for a previous session");
            return;
        }
        let Some(entry) = self.table.get(from) else {
            return;
        };
        let mut state = entry.lock();
        state.last_seen = Instant::now();
        state.suspended_at = None;
        state
            .outstanding
            .retain(|gsn, _| *gsn > applied && !received.contains(gsn));
    }

    async fn send_ack(&self, peer: &PeerId) {
        let ctrl = {
            let Some(entry) = self.table.get(peer) else {
                return;
            };
            let mut state = entry.lock();
            state.ack_pending = false;
            let Some(sid) = state.remote_session.clone() else {
                return;
            };
            ControlMeta::Ack {
                applied: state.last_applied,
                received: state.buffer.keys().copied().collect(),
                sid,
            }
        };
        let sent = self
            .handle
            .send(
                Payload::Binary(Bytes::new()),
                Target::Peer(peer.clone()),
                Some(ctrl.to_value()),
            )
            .await;
        if sent.is_ok() {
            metrics::inc(&metrics::ACKS_SENT);
        }
    }
}

/// Debounced ack: coalesces the acks for a burst of arrivals into one.
async fn ack_later(inner: Weak<ChannelInner>, peer: PeerId) {
    let debounce = match inner.upgrade() {
        Some(strong) => strong.config.ack_debounce(),
        None => return,
    };
    tokio::time::sleep(debounce).await;
    if let Some(inner) = inner.upgrade() {
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.send_ack(&peer).await;
    }
}

/// Delivers applied messages to subscribers on a single task, so handlers
/// observe strict order and never run under the peer-state lock.
async fn applier(inner: Arc<ChannelInner>, mut apply_rx: mpsc::UnboundedReceiver<Applied>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            item = apply_rx.recv() => {
                let Some(applied) = item else { break };
                let handlers: Vec<ReliableHandler> = inner.handlers.read().clone();
                for handler in handlers {
                    handler(&applied.payload, &applied.from, applied.metadata.as_ref());
                }
            }
        }
    }
}

/// The fixed-interval sweep: retransmits aged outstanding entries and sends
/// ack probes to every non-suspended peer with receive state.
async fn sweep(inner: Arc<ChannelInner>) {
    let mut interval = tokio::time::interval(inner.config.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        let mut retransmits: Vec<(PeerId, u64, Bytes, Option<Value>)> = Vec::new();
        let mut probes: Vec<PeerId> = Vec::new();

        for entry in inner.table.iter() {
            let peer = entry.key().clone();
            let mut state = entry.value().lock();

            for (gsn, out) in state.outstanding.iter_mut() {
                if now.duration_since(out.sent_at) >= inner.config.resend_timeout() {
                    out.sent_at = now;
                    retransmits.push((peer.clone(), *gsn, out.payload.clone(), out.metadata.clone()));
                }
            }

            if state.remote_session.is_some() {
                if now.duration_since(state.last_seen) >= inner.config.liveness_timeout() {
                    // Peer has gone quiet; stop probing until traffic resumes.
                    if state.suspended_at.is_none() {
                        debug!(%peer, "Suspending ack probing toward silent peer");
                        state.suspended_at = Some(now);
                    }
                } else {
                    state.suspended_at = None;
                    probes.push(peer.clone());
                }
            }
        }

        for (peer, gsn, payload, metadata) in retransmits {
            let ctrl = ControlMeta::Data {
                gsn,
                sid: inner.session.clone(),
                meta: metadata,
            };
            let sent = inner
                .handle
                .send(
                    Payload::Binary(payload),
                    Target::Peer(peer),
                    Some(ctrl.to_value()),
                )
                .await;
            if sent.is_ok() {
                metrics::inc(&metrics::RETRANSMISSIONS);
            }
        }
        for peer in probes {
            inner.send_ack(&peer).await;
        }
    }
}

/// Discards all channel state for peers leaving the live set. No delivery
/// guarantee survives departure.
async fn peer_watch(inner: Arc<ChannelInner>, mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(PeerEvent::Left(peer)) => {
                    if inner.table.remove(&peer).is_some() {
                        debug!(%peer, action = %inner.handle.action(), "Discarded channel state for departed peer");
                    }
                }
                Ok(PeerEvent::Joined(_)) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> ProtocolConfig {
        ProtocolConfig {
            resend_timeout_ms: 50,
            sweep_interval_ms: 25,
            ack_debounce_ms: 10,
            liveness_timeout_ms: 500,
            ..ProtocolConfig::default()
        }
    }

    async fn connected_pair(hub: &MemoryHub) -> (Connection, Connection) {
        let a = Connection::new(hub.connect(PeerId::parse("a").unwrap()))
            .await
            .unwrap();
        let b = Connection::new(hub.connect(PeerId::parse("b").unwrap()))
            .await
            .unwrap();
        let mut peers = a.peers();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !peers.borrow().is_empty() {
                    return;
                }
                peers.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        (a, b)
    }

    fn collect_payloads(channel: &ReliableChannel) -> Arc<Mutex<Vec<Vec<u8>>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        channel.on_receive(move |data, _, _| sink.lock().push(data.to_vec()));
        received
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let hub = MemoryHub::new();
        let (a, b) = connected_pair(&hub).await;
        let tx = ReliableChannel::with_config(&a, "data", fast_config()).unwrap();
        let rx = ReliableChannel::with_config(&b, "data", fast_config()).unwrap();
        let received = collect_payloads(&rx);

        for i in 0u8..5 {
            tx.send(b.self_id(), vec![i], None).await.unwrap();
        }

        wait_until("all five applied", || received.lock().len() == 5).await;
        assert_eq!(*received.lock(), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(rx.applied_cursor(a.self_id()), 5);
    }

    #[tokio::test]
    async fn test_user_metadata_passes_through() {
        let hub = MemoryHub::new();
        let (a, b) = connected_pair(&hub).await;
        let tx = ReliableChannel::with_config(&a, "data", fast_config()).unwrap();
        let rx = ReliableChannel::with_config(&b, "data", fast_config()).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        rx.on_receive(move |_, _, meta| {
            *sink.lock() = meta.cloned();
        });

        tx.send(b.self_id(), vec![1u8], Some(json!({"kind": "edit"})))
            .await
            .unwrap();

        wait_until("metadata seen", || seen.lock().is_some()).await;
        assert_eq!(seen.lock().clone().unwrap(), json!({"kind": "edit"}));
    }

    #[tokio::test]
    async fn test_outstanding_drains_on_ack() {
        let hub = MemoryHub::new();
        let (a, b) = connected_pair(&hub).await;
        let tx = ReliableChannel::with_config(&a, "data", fast_config()).unwrap();
        let _rx = ReliableChannel::with_config(&b, "data", fast_config()).unwrap();

        for i in 0u8..3 {
            tx.send(b.self_id(), vec![i], None).await.unwrap();
        }
        assert_eq!(tx.outstanding_to(b.self_id()), 3);

        wait_until("outstanding empty", || tx.outstanding_to(b.self_id()) == 0).await;
    }

    #[tokio::test]
    async fn test_departed_peer_state_discarded() {
        let hub = MemoryHub::new();
        let (a, b) = connected_pair(&hub).await;
        let tx = ReliableChannel::with_config(&a, "data", fast_config()).unwrap();

        // No receiver on b: outstanding accumulates.
        tx.send(b.self_id(), vec![1u8], None).await.unwrap();
        assert!(tx.has_state_for(b.self_id()));

        hub.disconnect(b.self_id());
        wait_until("state discarded", || !tx.has_state_for(b.self_id())).await;
        assert_eq!(tx.outstanding_to(b.self_id()), 0);
    }

    #[tokio::test]
    async fn test_fresh_session_resets_receiver() {
        let hub = MemoryHub::new();
        let (a, b) = connected_pair(&hub).await;
        let config = fast_config();
        let rx = ReliableChannel::with_config(&b, "data", config.clone()).unwrap();
        let received = collect_payloads(&rx);

        // First sender instance delivers gsn 1..=2.
        let tx1 = ReliableChannel::with_config(&a, "data", config.clone()).unwrap();
        tx1.send(b.self_id(), vec![1u8], None).await.unwrap();
        tx1.send(b.self_id(), vec![2u8], None).await.unwrap();
        wait_until("first session applied", || received.lock().len() == 2).await;
        drop(tx1);

        // A new sender instance under the same peer id restarts at gsn 1.
        // Without the session nonce these would be dropped as duplicates.
        let tx2 = ReliableChannel::with_config(&a, "data", config).unwrap();
        tx2.send(b.self_id(), vec![3u8], None).await.unwrap();
        wait_until("second session applied", || received.lock().len() == 3).await;
        assert_eq!(received.lock().last().unwrap(), &vec![3u8]);
        assert_eq!(rx.applied_cursor(a.self_id()), 1);
    }

    #[tokio::test]
    async fn test_probing_suspends_after_silence() {
        let hub = MemoryHub::new();
        let (a, b) = connected_pair(&hub).await;
        let config = ProtocolConfig {
            liveness_timeout_ms: 100,
            sweep_interval_ms: 25,
            ack_debounce_ms: 10,
            resend_timeout_ms: 50,
            ..ProtocolConfig::default()
        };
        let tx = ReliableChannel::with_config(&a, "data", config.clone()).unwrap();
        let rx = ReliableChannel::with_config(&b, "data", config).unwrap();
        let _received = collect_payloads(&rx);

        tx.send(b.self_id(), vec![1u8], None).await.unwrap();
        wait_until("applied", || rx.applied_cursor(a.self_id()) == 1).await;

        // a goes quiet; b's sweep eventually stops probing it.
        drop(tx);
        wait_until("probing suspended", || rx.probing_suspended(a.self_id())).await;
    }
}
