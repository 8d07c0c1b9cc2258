//! Connection / multiplexer: named logical channels over one transport.
//!
//! A [`Connection`] wraps a single [`TransportDriver`] and presents
//! independent actions, each with its own composed subscriber list. It also
//! tracks the live peer set, derives join/leave events from it, and measures
//! round-trip time over a pair of reserved actions. It does not retry,
//! reorder, or deduplicate; that is [`crate::reliable`]'s job.

use crate::config::ProtocolConfig;
use crate::error::{ConnectionError, TransportError};
use crate::transport::{TransportDriver, TransportEvent};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tandem_proto::{Action, Payload, PeerId, Uplink, PING_ACTION, PONG_ACTION};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A subscriber to one action's messages.
pub type ReceiveHandler = Arc<dyn Fn(&Payload, &PeerId, Option<&Value>) + Send + Sync>;

/// Membership changes derived from the live peer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer appeared in the live set.
    Joined(PeerId),
    /// A peer left the live set. All per-peer channel state dies with it.
    Left(PeerId),
}

/// Link-level conditions surfaced to the owning application.
///
/// The connection does not self-heal; reconnection policy is external.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A transport-level error was reported.
    Error(String),
    /// The underlying link closed. Terminal.
    Closed,
}

/// Where a send goes.
#[derive(Debug, Clone)]
pub enum Target {
    /// All currently live peers.
    Broadcast,
    /// One peer.
    Peer(PeerId),
    /// An explicit set of peers.
    Peers(Vec<PeerId>),
}

impl Target {
    fn into_wire(self) -> Option<Vec<PeerId>> {
        match self {
            Self::Broadcast => None,
            Self::Peer(id) => Some(vec![id]),
            Self::Peers(ids) => Some(ids),
        }
    }
}

impl From<PeerId> for Target {
    fn from(id: PeerId) -> Self {
        Self::Peer(id)
    }
}

struct PendingPing {
    nonce: String,
    sent_at: Instant,
    resolve: oneshot::Sender<Duration>,
}

struct ConnectionInner {
    driver: Arc<dyn TransportDriver>,
    self_id: PeerId,
    handlers: DashMap<String, Vec<ReceiveHandler>>,
    peers_tx: watch::Sender<Vec<PeerId>>,
    peer_events_tx: broadcast::Sender<PeerEvent>,
    link_events_tx: broadcast::Sender<LinkEvent>,
    pings: DashMap<PeerId, PendingPing>,
    ping_timeout: Duration,
    shutdown: CancellationToken,
}

/// One multiplexed connection over a transport driver.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a transport driver with default protocol timing.
    pub async fn new(driver: Arc<dyn TransportDriver>) -> Result<Self, ConnectionError> {
        Self::with_config(driver, &ProtocolConfig::default()).await
    }

    /// Wrap a transport driver, waiting for it to become ready.
    pub async fn with_config(
        driver: Arc<dyn TransportDriver>,
        protocol: &ProtocolConfig,
    ) -> Result<Self, ConnectionError> {
        driver.ready().await?;
        let events = driver
            .take_events()
            .ok_or(TransportError::Closed)?;

        let self_id = driver.self_id().clone();
        let (peers_tx, _) = watch::channel(Vec::new());
        let (peer_events_tx, _) = broadcast::channel(256);
        let (link_events_tx, _) = broadcast::channel(64);

        let inner = Arc::new(ConnectionInner {
            driver,
            self_id,
            handlers: DashMap::new(),
            peers_tx,
            peer_events_tx,
            link_events_tx,
            pings: DashMap::new(),
            ping_timeout: protocol.ping_timeout(),
            shutdown: CancellationToken::new(),
        });

        register_ping_handlers(&inner);
        tokio::spawn(pump(Arc::clone(&inner), events));

        Ok(Self { inner })
    }

    /// This connection's own peer id.
    #[must_use]
    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    /// Observe the live peer set.
    #[must_use]
    pub fn peers(&self) -> watch::Receiver<Vec<PeerId>> {
        self.inner.peers_tx.subscribe()
    }

    /// Snapshot of the live peer set.
    #[must_use]
    pub fn live_peers(&self) -> Vec<PeerId> {
        self.inner.peers_tx.borrow().clone()
    }

    /// Subscribe to join/leave events.
    #[must_use]
    pub fn peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.peer_events_tx.subscribe()
    }

    /// Subscribe to link errors and closure.
    #[must_use]
    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.link_events_tx.subscribe()
    }

    /// Open a named logical channel over this connection.
    pub fn action(&self, name: &str) -> Result<ActionHandle, ConnectionError> {
        let action = Action::new(name)?;
        Ok(ActionHandle {
            inner: Arc::clone(&self.inner),
            action,
        })
    }

    /// Measure round-trip time to a peer.
    ///
    /// Resolves with the measured time, or `None` once the ping timeout
    /// elapses without a matching pong ("unreachable").
    pub async fn ping(&self, peer: &PeerId) -> Option<Duration> {
        let nonce = Uuid::new_v4().to_string();
        let (resolve, resolved) = oneshot::channel();
        self.inner.pings.insert(
            peer.clone(),
            PendingPing {
                nonce: nonce.clone(),
                sent_at: Instant::now(),
                resolve,
            },
        );

        let sent = self
            .inner
            .send_on(PING_ACTION, Payload::Json(Value::String(nonce)), Some(peer.clone()), None)
            .await;
        if sent.is_err() {
            self.inner.pings.remove(peer);
            return None;
        }

        match tokio::time::timeout(self.inner.ping_timeout, resolved).await {
            Ok(Ok(rtt)) => Some(rtt),
            _ => {
                self.inner.pings.remove(peer);
                None
            }
        }
    }

    /// Tear down the connection: cancels the event pump and every task
    /// scoped to this connection.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl ConnectionInner {
    async fn send_on(
        &self,
        action: &str,
        data: Payload,
        target: Option<PeerId>,
        metadata: Option<Value>,
    ) -> Result<(), ConnectionError> {
        self.driver
            .send(Uplink {
                action: action.to_string(),
                data,
                target_peers: target.map(|id| vec![id]),
                metadata,
            })
            .await?;
        Ok(())
    }
}

/// One logical channel: a send half and a subscribe half.
#[derive(Clone)]
pub struct ActionHandle {
    inner: Arc<ConnectionInner>,
    action: Action,
}

impl ActionHandle {
    /// The action this handle is bound to.
    #[must_use]
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Send on this action. Resolves once handed to the transport, not
    /// once delivered.
    ///
    /// `metadata` is only supported alongside binary payloads; this is
    /// checked eagerly.
    pub async fn send(
        &self,
        data: impl Into<Payload>,
        target: Target,
        metadata: Option<Value>,
    ) -> Result<(), ConnectionError> {
        let data = data.into();
        if metadata.is_some() && !data.is_binary() {
            return Err(ConnectionError::MetadataRequiresBinary);
        }
        self.inner
            .driver
            .send(Uplink {
                action: self.action.as_str().to_string(),
                data,
                target_peers: target.into_wire(),
                metadata,
            })
            .await?;
        Ok(())
    }

    /// Subscribe to this action. Subscribers compose: all run, in
    /// subscription order.
    pub fn on_receive<F>(&self, handler: F)
    where
        F: Fn(&Payload, &PeerId, Option<&Value>) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .entry(self.action.as_str().to_string())
            .or_default()
            .push(Arc::new(handler));
    }
}

async fn pump(inner: Arc<ConnectionInner>, mut events: mpsc::Receiver<TransportEvent>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(TransportEvent::Message(down)) => dispatch(&inner, down),
                Some(TransportEvent::Peers(peers)) => update_peers(&inner, peers),
                Some(TransportEvent::Error(message)) => {
                    warn!(%message, "Transport error");
                    let _ = inner.link_events_tx.send(LinkEvent::Error(message));
                }
                Some(TransportEvent::Closed) | None => {
                    let _ = inner.link_events_tx.send(LinkEvent::Closed);
                    break;
                }
            }
        }
    }
}

fn dispatch(inner: &Arc<ConnectionInner>, down: tandem_proto::Downlink) {
    let handlers: Vec<ReceiveHandler> = match inner.handlers.get(&down.action) {
        Some(list) => list.clone(),
        None => {
            debug!(action = %down.action, from = %down.peer_id, "Dropping message for unknown action");
            return;
        }
    };
    for handler in handlers {
        handler(&down.data, &down.peer_id, down.metadata.as_ref());
    }
}

fn update_peers(inner: &Arc<ConnectionInner>, new_peers: Vec<PeerId>) {
    let old: HashSet<PeerId> = inner.peers_tx.borrow().iter().cloned().collect();
    let new: HashSet<PeerId> = new_peers.iter().cloned().collect();

    inner.peers_tx.send_replace(new_peers);

    for joined in new.difference(&old) {
        let _ = inner.peer_events_tx.send(PeerEvent::Joined(joined.clone()));
    }
    for left in old.difference(&new) {
        inner.pings.remove(left);
        let _ = inner.peer_events_tx.send(PeerEvent::Left(left.clone()));
    }
}

fn register_ping_handlers(inner: &Arc<ConnectionInner>) {
    // Echo pings back on the pong action.
    let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
    inner.handlers.entry(PING_ACTION.to_string()).or_default().push(Arc::new(
        move |data: &Payload, from: &PeerId, _meta: Option<&Value>| {
            let Some(inner) = weak.upgrade() else { return };
            let data = data.clone();
            let from = from.clone();
            tokio::spawn(async move {
                let _ = inner.send_on(PONG_ACTION, data, Some(from), None).await;
            });
        },
    ));

    // Resolve a pending ping when its pong arrives.
    let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
    inner.handlers.entry(PONG_ACTION.to_string()).or_default().push(Arc::new(
        move |data: &Payload, from: &PeerId, _meta: Option<&Value>| {
            let Some(inner) = weak.upgrade() else { return };
            let Some(nonce) = data.as_json().and_then(|v| v.as_str()) else {
                return;
            };
            let matches = inner
                .pings
                .get(from)
                .is_some_and(|pending| pending.nonce == nonce);
            if matches {
                if let Some((_, pending)) = inner.pings.remove(from) {
                    let _ = pending.resolve.send(pending.sent_at.elapsed());
                }
            }
        },
    ));
}
