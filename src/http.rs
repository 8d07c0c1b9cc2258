//! HTTP server for the relay's status page and Prometheus metrics.
//!
//! Runs on a separate tokio task, bound to `relay.metrics_listen`.

use crate::metrics;
use crate::relay::Relay;
use axum::extract::State;
use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
struct StatusState {
    relay: Arc<Relay>,
    started_at: DateTime<Utc>,
}

/// Handler for GET / - a one-line plain text status page.
async fn status_handler(State(state): State<StatusState>) -> String {
    format!(
        "Tandem relay. {} active room(s), {} connected peer(s). Up since {}.",
        state.relay.room_count(),
        state.relay.peer_count(),
        state.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

/// Handler for GET /metrics - Prometheus metrics in text format.
async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

/// Run the status/metrics HTTP server.
///
/// This is a long-running task that should be spawned in the background.
pub async fn run_http_server(addr: SocketAddr, relay: Arc<Relay>) {
    let state = StatusState {
        relay,
        started_at: Utc::now(),
    };
    let app = Router::new()
        .route("/", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    tracing::info!("Status/metrics HTTP server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("HTTP server error: {}", e);
    }
}
