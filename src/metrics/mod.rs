//! Prometheus metrics for the broadcaster hub.
//!
//! - Hub metrics (connected clients, channels, subscriptions)
//! - Delivery metrics (delivered and dropped channel messages)
//! - Protocol metrics (received commands, close codes)
//! - Relay metrics (upstream messages, reconnects)

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "broadcaster";

lazy_static! {
    // ============================================================================
    // Hub Metrics
    // ============================================================================

    /// Number of registered clients
    pub static ref CLIENTS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_clients_connected", METRIC_PREFIX),
        "Number of registered clients"
    ).unwrap();

    /// Number of channels known to the hub
    pub static ref CHANNELS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_channels_active", METRIC_PREFIX),
        "Number of channels created since startup"
    ).unwrap();

    /// Total new (client, channel) subscriptions
    pub static ref SUBSCRIPTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_subscriptions_total", METRIC_PREFIX),
        "Total channel subscriptions"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Channel messages queued for a client
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total channel messages queued for clients"
    ).unwrap();

    /// Channel messages dropped because a client queue was full or closed
    pub static ref MESSAGES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_dropped_total", METRIC_PREFIX),
        "Total channel messages dropped"
    ).unwrap();

    // ============================================================================
    // Protocol Metrics
    // ============================================================================

    /// Client commands received by type
    pub static ref COMMANDS_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_commands_received_total", METRIC_PREFIX),
        "Total client commands received",
        &["type"]
    ).unwrap();

    /// Connections closed by the server, by close code
    pub static ref CONNECTIONS_REFUSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_refused_total", METRIC_PREFIX),
        "Total connections closed with a protocol error",
        &["code"]
    ).unwrap();

    // ============================================================================
    // Relay Metrics
    // ============================================================================

    /// Messages received from the upstream store
    pub static ref UPSTREAM_MESSAGES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_upstream_messages_total", METRIC_PREFIX),
        "Total messages received from the upstream store"
    ).unwrap();

    /// Upstream connection attempts after a failure
    pub static ref RELAY_RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_relay_reconnects_total", METRIC_PREFIX),
        "Total upstream reconnect attempts"
    ).unwrap();
}

/// Encode all registered metrics in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper for recording protocol metrics
pub struct ProtocolMetrics;

impl ProtocolMetrics {
    pub fn record_command(command: &str) {
        COMMANDS_RECEIVED_TOTAL.with_label_values(&[command]).inc();
    }

    pub fn record_refused(code: u16) {
        let code = code.to_string();
        CONNECTIONS_REFUSED_TOTAL
            .with_label_values(&[code.as_str()])
            .inc();
    }
}
