//! Integration test common infrastructure.
//!
//! Helpers for wiring connections over the in-memory hub, shrinking
//! protocol timing, and waiting on asynchronous convergence.

use std::time::Duration;
use tandem_proto::PeerId;
use tandemd::config::ProtocolConfig;
use tandemd::connection::Connection;
use tandemd::transport::memory::MemoryHub;

/// Protocol timing shrunk for test wall-clock.
#[allow(dead_code)]
pub fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig {
        resend_timeout_ms: 50,
        sweep_interval_ms: 25,
        ack_debounce_ms: 10,
        liveness_timeout_ms: 10_000,
        ping_timeout_ms: 1_000,
        join_timeout_ms: 2_000,
    }
}

/// Connect a peer to the hub and wrap it in a connection.
#[allow(dead_code)]
pub async fn connect(hub: &MemoryHub, id: &str) -> Connection {
    Connection::new(hub.connect(PeerId::parse(id).unwrap()))
        .await
        .expect("connection")
}

/// Wait until the connection sees at least `n` live peers.
#[allow(dead_code)]
pub async fn wait_for_peers(conn: &Connection, n: usize) {
    let mut peers = conn.peers();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if peers.borrow().len() >= n {
                return;
            }
            peers.changed().await.expect("peers watch closed");
        }
    })
    .await
    .expect("peer set never reached expected size");
}

/// Poll `check` until it passes or a timeout expires.
#[allow(dead_code)]
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    wait_until_for(what, Duration::from_secs(5), &mut check).await;
}

/// Poll `check` until it passes or `limit` expires.
#[allow(dead_code)]
pub async fn wait_until_for(what: &str, limit: Duration, check: &mut impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
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
