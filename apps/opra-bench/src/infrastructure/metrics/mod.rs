//! Prometheus Metrics Module
//!
//! Counters and gauges for the publish and subscribe paths, exported in
//! Prometheus format when a metrics port is configured.
//!
//! # Metrics Categories
//!
//! - **Messages**: sent, received and malformed counts
//! - **Back-pressure**: transient publication rejections
//! - **Throughput**: per-interval rates published by the rate reporter
//!
//! # Integration
//!
//! Without an installed recorder every call here is a no-op, so the hot
//! loops record unconditionally.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

// =============================================================================
// Exporter
// =============================================================================

static EXPORTER_ADDR: OnceLock<SocketAddr> = OnceLock::new();

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install the exporter (e.g. port already in use).
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Install the Prometheus exporter serving `/metrics` on `port`.
///
/// Must be called from within a tokio runtime. Later calls return the
/// address of the exporter installed first.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn init_metrics(port: u16) -> Result<SocketAddr, MetricsError> {
    if let Some(addr) = EXPORTER_ADDR.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();
    tracing::info!(%addr, "Prometheus metrics exporter started");
    Ok(*EXPORTER_ADDR.get_or_init(|| addr))
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Message counters
    describe_counter!(
        "opra_bench_messages_sent_total",
        "Total messages accepted by the publication"
    );
    describe_counter!(
        "opra_bench_messages_received_total",
        "Total messages decoded by the subscriber"
    );
    describe_counter!(
        "opra_bench_malformed_total",
        "Total messages dropped as undecodable"
    );
    describe_counter!(
        "opra_bench_bytes_total",
        "Total framed bytes by direction"
    );

    // Back-pressure
    describe_counter!(
        "opra_bench_back_pressure_total",
        "Total transient publication rejections"
    );

    // Throughput gauges
    describe_gauge!(
        "opra_bench_throughput_msgs_per_sec",
        "Messages per second over the last reporting interval"
    );
    describe_gauge!(
        "opra_bench_throughput_bytes_per_sec",
        "Bytes per second over the last reporting interval"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Which side of the stream a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Publisher.
    Sent,
    /// Subscriber.
    Received,
}

impl Direction {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

/// Record one transient publication rejection.
pub fn record_back_pressure() {
    counter!("opra_bench_back_pressure_total").increment(1);
}

/// Record one malformed message.
pub fn record_malformed() {
    counter!("opra_bench_malformed_total").increment(1);
}

/// Record messages and bytes moved since the last call.
pub fn record_messages(direction: Direction, messages: u64, bytes: u64) {
    let name = match direction {
        Direction::Sent => "opra_bench_messages_sent_total",
        Direction::Received => "opra_bench_messages_received_total",
    };
    counter!(name).increment(messages);
    counter!(
        "opra_bench_bytes_total",
        "direction" => direction.as_str()
    )
    .increment(bytes);
}

/// Update the throughput gauges.
pub fn set_throughput(direction: Direction, msgs_per_sec: f64, bytes_per_sec: f64) {
    gauge!(
        "opra_bench_throughput_msgs_per_sec",
        "direction" => direction.as_str()
    )
    .set(msgs_per_sec);
    gauge!(
        "opra_bench_throughput_bytes_per_sec",
        "direction" => direction.as_str()
    )
    .set(bytes_per_sec);
}

// =============================================================================
// Tests
// =============================================================================
