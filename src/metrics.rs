//! Prometheus metrics collection for tandemd.
//!
//! Tracks relay throughput, reliable-channel recovery activity, and room
//! occupancy. Exposed on the relay's metrics HTTP endpoint (see
//! [`crate::http`]).

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Messages relayed to downlinks, labeled by resolution outcome.
pub static RELAYED_MESSAGES: OnceLock<IntCounterVec> = OnceLock::new();

/// Uplink frames dropped as malformed.
pub static MALFORMED_FRAMES: OnceLock<IntCounter> = OnceLock::new();

/// Reliable-channel retransmissions performed by the sweep.
pub static RETRANSMISSIONS: OnceLock<IntCounter> = OnceLock::new();

/// Duplicate data frames discarded by receivers.
pub static DUPLICATES_DISCARDED: OnceLock<IntCounter> = OnceLock::new();

/// Acks sent (debounced and probe).
pub static ACKS_SENT: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Rooms currently active on the relay.
pub static ACTIVE_ROOMS: OnceLock<IntGauge> = OnceLock::new();

/// Peers currently connected to the relay.
pub static CONNECTED_PEERS: OnceLock<IntGauge> = OnceLock::new();

/// Register all metrics with the global registry. Idempotent enough for
/// one call from `main`; duplicate registrations log and continue.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(
        RELAYED_MESSAGES,
        IntCounterVec::new(
            Opts::new("tandem_relayed_messages_total", "Messages relayed to downlinks"),
            &["status"]
        )
    );
    register!(
        MALFORMED_FRAMES,
        IntCounter::new("tandem_malformed_frames_total", "Uplink frames dropped as malformed")
    );
    register!(
        RETRANSMISSIONS,
        IntCounter::new("tandem_retransmissions_total", "Reliable-channel retransmissions")
    );
    register!(
        DUPLICATES_DISCARDED,
        IntCounter::new("tandem_duplicates_discarded_total", "Duplicate data frames discarded")
    );
    register!(ACKS_SENT, IntCounter::new("tandem_acks_sent_total", "Acks sent"));
    register!(ACTIVE_ROOMS, IntGauge::new("tandem_active_rooms", "Rooms currently active"));
    register!(
        CONNECTED_PEERS,
        IntGauge::new("tandem_connected_peers", "Peers currently connected")
    );
}

/// Record a relayed message outcome (`"delivered"` or `"no_target"`).
pub fn record_relayed(status: &str) {
    if let Some(c) = RELAYED_MESSAGES.get() {
        c.with_label_values(&[status]).inc();
    }
}

/// Increment a plain counter if metrics are initialized.
pub fn inc(counter: &OnceLock<IntCounter>) {
    if let Some(c) = counter.get() {
        c.inc();
    }
}

/// Adjust a gauge if metrics are initialized.
pub fn add_gauge(gauge: &OnceLock<IntGauge>, delta: i64) {
    if let Some(g) = gauge.get() {
        g.add(delta);
    }
}

/// Render all registered metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
