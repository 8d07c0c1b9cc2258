//! WebSocket transport driver speaking the relay protocol.
//!
//! Connects to a relay at `ws://host:port/{room_id}/{peer_id}`. Downlinks on
//! the reserved `__update_peers__` action update the live peer set and never
//! reach subscribers; everything else is surfaced verbatim.

use crate::error::TransportError;
use crate::transport::{TransportDriver, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tandem_proto::{Downlink, PeerId, RoomId, Uplink, WireFrame, UPDATE_PEERS_ACTION};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Event channel depth; a slow consumer backpressures the read loop.
const EVENT_BUFFER: usize = 256;

/// A relay-backed [`TransportDriver`].
pub struct WsTransport {
    self_id: PeerId,
    out_tx: mpsc::Sender<WireFrame>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    shutdown: CancellationToken,
}

impl WsTransport {
    /// Connect to a relay and join `room` as `self_id`.
    ///
    /// `url` is the relay base, e.g. `ws://127.0.0.1:8080`.
    pub async fn connect(
        url: &str,
        room: &RoomId,
        self_id: PeerId,
    ) -> Result<Arc<Self>, TransportError> {
        let endpoint = format!("{url}/{room}/{self_id}");
        let (stream, _) = connect_async(endpoint.as_str()).await?;
        let (sink, source) = stream.split();

        let (out_tx, out_rx) = mpsc::channel::<WireFrame>(EVENT_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(EVENT_BUFFER);
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(sink, out_rx, shutdown.clone()));
        tokio::spawn(read_loop(source, event_tx, self_id.clone(), shutdown.clone()));

        Ok(Arc::new(Self {
            self_id,
            out_tx,
            events: Mutex::new(Some(event_rx)),
            shutdown,
        }))
    }

    /// Close the link and stop both pump tasks.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TransportDriver for WsTransport {
    fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    async fn ready(&self) -> Result<(), TransportError> {
        // The websocket handshake completed in `connect`.
        if self.shutdown.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, uplink: Uplink) -> Result<(), TransportError> {
        let frame = uplink.encode()?;
        self.out_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }
}

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

async fn write_loop(mut sink: WsSink, mut out_rx: mpsc::Receiver<WireFrame>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = out_rx.recv() => {
                let msg = match frame {
                    Some(WireFrame::Binary(bytes)) => Message::Binary(bytes.to_vec()),
                    Some(WireFrame::Text(text)) => Message::Text(text),
                    None => break,
                };
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: WsSource,
    event_tx: mpsc::Sender<TransportEvent>,
    self_id: PeerId,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_frame(WireFrame::Binary(Bytes::from(bytes)), &event_tx, &self_id).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(WireFrame::Text(text), &event_tx, &self_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = event_tx.send(TransportEvent::Closed).await;
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong frames handled by tungstenite
                    Some(Err(e)) => {
                        let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                        let _ = event_tx.send(TransportEvent::Closed).await;
                        break;
                    }
                }
            }
        }
    }
    shutdown.cancel();
}

async fn handle_frame(frame: WireFrame, event_tx: &mpsc::Sender<TransportEvent>, self_id: &PeerId) {
    let down = match Downlink::decode(frame) {
        Ok(down) => down,
        Err(e) => {
            // Protocol violation: drop the single offending message.
            warn!(error = %e, "Dropping malformed downlink frame");
            return;
        }
    };

    if down.action == UPDATE_PEERS_ACTION {
        let peers = parse_peer_list(&down, self_id);
        let _ = event_tx.send(TransportEvent::Peers(peers)).await;
        return;
    }

    let _ = event_tx.send(TransportEvent::Message(down)).await;
}

fn parse_peer_list(down: &Downlink, self_id: &PeerId) -> Vec<PeerId> {
    let Some(list) = down.data.as_json().and_then(|v| v.as_array()) else {
        warn!("Peer-list downlink without an array payload");
        return Vec::new();
    };
    list.iter()
        .filter_map(|v| v.as_str())
        .filter_map(|s| PeerId::parse(s).ok())
        .filter(|id| id != self_id)
        .collect()
}
