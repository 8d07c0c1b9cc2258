//! Configuration loading and management.
//!
//! Two sections: `[relay]` for the daemon (listen addresses, room limits,
//! the delivery-delay testing aid) and `[protocol]` for the timing knobs of
//! the reliable channel and session bootstrap. Every field has a serde
//! default so a minimal config file, or none at all, still runs.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub protocol: ProtocolConfig,
}

/// Relay daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the relay websocket listener binds.
    pub listen: String,

    /// Address of the metrics/status HTTP listener; `None` disables it.
    pub metrics_listen: Option<String>,

    /// Artificial per-message delivery delay in milliseconds. Testing aid
    /// for exercising retransmission; leave at 0 in production.
    pub manual_delay_ms: u64,

    /// Maximum peers admitted per room.
    pub max_room_peers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            metrics_listen: None,
            manual_delay_ms: 0,
            max_room_peers: 32,
        }
    }
}

impl RelayConfig {
    /// The artificial delivery delay, if configured.
    #[must_use]
    pub fn manual_delay(&self) -> Option<Duration> {
        (self.manual_delay_ms > 0).then(|| Duration::from_millis(self.manual_delay_ms))
    }
}

/// Timing knobs for the reliable channel and session bootstrap.
///
/// The defaults are the protocol's reference values; tests shrink them to
/// keep wall-clock time down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Age after which an unacked outstanding message is retransmitted.
    pub resend_timeout_ms: u64,

    /// Interval of the retransmission/ack-probe sweep.
    pub sweep_interval_ms: u64,

    /// Coalescing window for outgoing acks after applying data.
    pub ack_debounce_ms: u64,

    /// Silence window after which ack probing toward a peer is suspended.
    pub liveness_timeout_ms: u64,

    /// Time a ping waits for its pong before reporting unreachable.
    pub ping_timeout_ms: u64,

    /// Time a joining client waits for the host's snapshot.
    pub join_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            resend_timeout_ms: 2_000,
            sweep_interval_ms: 2_000,
            ack_debounce_ms: 200,
            liveness_timeout_ms: 10_000,
            ping_timeout_ms: 10_000,
            join_timeout_ms: 15_000,
        }
    }
}

impl ProtocolConfig {
    /// Age after which an unacked outstanding message is retransmitted.
    #[must_use]
    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    /// Interval of the retransmission/ack-probe sweep.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Coalescing window for outgoing acks.
    #[must_use]
    pub fn ack_debounce(&self) -> Duration {
        Duration::from_millis(self.ack_debounce_ms)
    }

    /// Silence window after which ack probing is suspended.
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Time a ping waits for its pong.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Time a joining client waits for the host's snapshot.
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay
            .listen
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("relay.listen: {e}")))?;
        if let Some(metrics) = &self.relay.metrics_listen {
            metrics
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::Invalid(format!("relay.metrics_listen: {e}")))?;
        }
        if self.relay.max_room_peers < 2 {
            return Err(ConfigError::Invalid(
                "relay.max_room_peers must be at least 2".into(),
            ));
        }
        if self.protocol.sweep_interval_ms == 0 || self.protocol.resend_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "protocol sweep/resend intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.protocol.resend_timeout(), Duration::from_secs(2));
        assert_eq!(config.protocol.ack_debounce(), Duration::from_millis(200));
        assert!(config.relay.manual_delay().is_none());
    }

    #[test]
    fn test_load_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[relay]
listen = "0.0.0.0:9001"
manual_delay_ms = 50

[protocol]
resend_timeout_ms = 100
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.relay.listen, "0.0.0.0:9001");
        assert_eq!(config.relay.manual_delay(), Some(Duration::from_millis(50)));
        // Unset fields keep their defaults.
        assert_eq!(config.protocol.sweep_interval_ms, 2_000);
        assert_eq!(config.protocol.resend_timeout_ms, 100);
    }

    #[test]
    fn test_rejects_unparseable_listen() {
        let config = Config {
            relay: RelayConfig {
                listen: "not-an-addr".into(),
                ..RelayConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_sweep() {
        let config = Config {
            protocol: ProtocolConfig {
                sweep_interval_ms: 0,
                ..ProtocolConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_room_limit() {
        let config = Config {
            relay: RelayConfig {
                max_room_peers: 1,
                ..RelayConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
