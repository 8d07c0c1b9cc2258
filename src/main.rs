//! tandemd - the Tandem relay daemon.
//!
//! A dumb websocket message switch: rooms, peer lists, verbatim forwarding.
//! All sync intelligence lives in the peers.

use std::sync::Arc;
use tandemd::config::Config;
use tandemd::relay::Relay;
use tandemd::{http, metrics, telemetry};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path, error = %e, "Failed to load config");
            e
        })?
    } else {
        info!(path = %config_path, "No config file, using defaults");
        Config::default()
    };

    metrics::init();

    let relay = Arc::new(Relay::bind(config.relay.clone()).await?);
    info!(addr = %relay.local_addr(), "tandemd relay listening");

    if let Some(metrics_listen) = &config.relay.metrics_listen {
        let addr = metrics_listen.parse()?;
        tokio::spawn(http::run_http_server(addr, Arc::clone(&relay)));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    relay.shutdown();
    Ok(())
}
