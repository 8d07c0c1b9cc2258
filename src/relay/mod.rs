//! The relay: a dumb message switch between peers in rooms.
//!
//! Clients connect to `ws://host:port/{room_id}/{peer_id}`. The relay
//! forwards each uplink verbatim to its resolved targets (explicit list or
//! the whole room), always excluding the sender, and annotates it with the
//! sender's id. Join and leave both re-broadcast the room's peer-id list on
//! the reserved `__update_peers__` action; a room reaching zero members is
//! discarded. The relay understands nothing of actions, reliability, or
//! documents; those live entirely at the edges.

use crate::config::RelayConfig;
use crate::metrics;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_proto::{Downlink, Payload, PeerId, RoomId, Uplink, WireFrame, UPDATE_PEERS_ACTION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The sender id the relay stamps on its own downlinks.
const RELAY_PEER_ID: &str = "server";

/// Outgoing queue depth per connected peer.
const PEER_QUEUE: usize = 256;

struct PeerSlot {
    tx: mpsc::Sender<Message>,
    conn_id: u64,
}

struct Room {
    peers: DashMap<PeerId, PeerSlot>,
}

impl Room {
    fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }
}

struct RelayInner {
    config: RelayConfig,
    rooms: DashMap<RoomId, Arc<Room>>,
    next_conn_id: AtomicU64,
}

/// A running relay listener.
///
/// Dropping it stops the accept loop and every per-connection task.
pub struct Relay {
    inner: Arc<RelayInner>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Relay {
    /// Bind the configured listen address and start accepting connections.
    pub async fn bind(config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen.as_str()).await?;
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(RelayInner {
            config,
            rooms: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(Arc::clone(&inner), listener, shutdown.clone()));
        Ok(Self {
            inner,
            local_addr,
            shutdown,
        })
    }

    /// The address the relay actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A connectable websocket base URL for this relay.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Number of connected peers across all rooms.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.rooms.iter().map(|r| r.peers.len()).sum()
    }

    /// Stop accepting and disconnect everyone.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Host mode: run an embedded relay and join it over loopback.
///
/// Lets a session host serve its own room with no external relay; clients
/// connect to the returned relay's address. Both halves die together: drop
/// the relay and the host's transport closes with it.
pub async fn host_embedded(
    config: RelayConfig,
    room: &RoomId,
    host_id: PeerId,
) -> Result<(Relay, Arc<crate::transport::ws::WsTransport>), crate::error::TransportError> {
    let relay = Relay::bind(config).await?;
    let transport = crate::transport::ws::WsTransport::connect(&relay.url(), room, host_id).await?;
    Ok((relay, transport))
}

async fn accept_loop(inner: Arc<RelayInner>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(
                        Arc::clone(&inner),
                        stream,
                        addr,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }
    }
}

/// Extract `(room, peer)` from a `/{room_id}/{peer_id}` request path.
fn parse_path(path: &str) -> Option<(RoomId, PeerId)> {
    let (room, peer) = path.strip_prefix('/')?.split_once('/')?;
    if peer.contains('/') {
        return None;
    }
    Some((RoomId::parse(room).ok()?, PeerId::parse(peer).ok()?))
}

async fn handle_connection(
    inner: Arc<RelayInner>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let mut route: Option<(RoomId, PeerId)> = None;
    let callback = |req: &Request, resp: Response| match parse_path(req.uri().path()) {
        Some(parsed) => {
            route = Some(parsed);
            Ok(resp)
        }
        None => {
            let mut resp = ErrorResponse::new(Some("Not found".to_string()));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Err(resp)
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%addr, error = %e, "Handshake rejected");
            return;
        }
    };
    let Some((room_id, peer_id)) = route else {
        return;
    };

    let room = Arc::clone(
        &inner
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Room::new())),
    );
    if room.peers.len() >= inner.config.max_room_peers {
        warn!(%room_id, %peer_id, "Room full, rejecting peer");
        return;
    }

    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(PEER_QUEUE);
    // A reconnect under the same id replaces the previous slot; the old
    // writer's queue closes with it.
    room.peers.insert(
        peer_id.clone(),
        PeerSlot {
            tx: out_tx,
            conn_id,
        },
    );
    metrics::add_gauge(&metrics::CONNECTED_PEERS, 1);
    if let Some(g) = metrics::ACTIVE_ROOMS.get() {
        g.set(inner.rooms.len() as i64);
    }
    info!(%peer_id, %room_id, "Peer joined room");
    broadcast_peer_list(&room);

    let (mut sink, mut source) = ws.split();
    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                msg = out_rx.recv() => match msg {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = source.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    relay_uplink(&inner, &room, &peer_id, WireFrame::Binary(Bytes::from(bytes)));
                }
                Some(Ok(Message::Text(text))) => {
                    relay_uplink(&inner, &room, &peer_id, WireFrame::Text(text));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    debug!(%peer_id, error = %e, "Socket error");
                    break;
                }
            }
        }
    }

    writer.abort();

    // Only unregister if this connection still owns the slot.
    let still_owner = room
        .peers
        .get(&peer_id)
        .is_some_and(|slot| slot.conn_id == conn_id);
    if still_owner {
        room.peers.remove(&peer_id);
        metrics::add_gauge(&metrics::CONNECTED_PEERS, -1);
        info!(%peer_id, %room_id, "Peer left room");
        if room.peers.is_empty() {
            inner.rooms.remove(&room_id);
            info!(%room_id, "Room empty, removed");
        } else {
            broadcast_peer_list(&room);
        }
        if let Some(g) = metrics::ACTIVE_ROOMS.get() {
            g.set(inner.rooms.len() as i64);
        }
    }
}

fn relay_uplink(inner: &Arc<RelayInner>, room: &Arc<Room>, sender: &PeerId, frame: WireFrame) {
    let uplink = match Uplink::decode(frame) {
        Ok(uplink) => uplink,
        Err(e) => {
            metrics::inc(&metrics::MALFORMED_FRAMES);
            warn!(%sender, error = %e, "Dropping malformed uplink");
            return;
        }
    };

    let downlink = Downlink {
        action: uplink.action,
        data: uplink.data,
        peer_id: sender.clone(),
        metadata: uplink.metadata,
    };
    let msg = match encode_message(&downlink) {
        Some(msg) => msg,
        None => return,
    };

    let targets: Vec<mpsc::Sender<Message>> = match &uplink.target_peers {
        Some(explicit) => explicit
            .iter()
            .filter(|id| *id != sender)
            .filter_map(|id| room.peers.get(id).map(|slot| slot.tx.clone()))
            .collect(),
        None => room
            .peers
            .iter()
            .filter(|entry| entry.key() != sender)
            .map(|entry| entry.value().tx.clone())
            .collect(),
    };

    if targets.is_empty() {
        metrics::record_relayed("no_target");
        return;
    }
    metrics::record_relayed("delivered");

    let delay = inner.config.manual_delay();
    for tx in targets {
        let msg = msg.clone();
        match delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(msg).await;
                });
            }
            None => {
                // A full queue means a stalled consumer; drop rather than
                // block the relay.
                let _ = tx.try_send(msg);
            }
        }
    }
}

fn broadcast_peer_list(room: &Arc<Room>) {
    let ids: Vec<Value> = room
        .peers
        .iter()
        .map(|entry| Value::String(entry.key().to_string()))
        .collect();
    let downlink = Downlink {
        action: UPDATE_PEERS_ACTION.to_string(),
        data: Payload::Json(Value::Array(ids)),
        peer_id: match PeerId::parse(RELAY_PEER_ID) {
            Ok(id) => id,
            Err(_) => return,
        },
        metadata: None,
    };
    let Some(msg) = encode_message(&downlink) else {
        return;
    };
    for entry in room.peers.iter() {
        let _ = entry.value().tx.try_send(msg.clone());
    }
}

fn encode_message(downlink: &Downlink) -> Option<Message> {
    match downlink.encode() {
        Ok(WireFrame::Binary(bytes)) => Some(Message::Binary(bytes.to_vec())),
        Ok(WireFrame::Text(text)) => Some(Message::Text(text)),
        Err(e) => {
            warn!(error = %e, "Failed to encode downlink");
            None
        }
    }
}
