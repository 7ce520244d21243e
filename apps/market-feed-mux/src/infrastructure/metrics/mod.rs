//! Prometheus Metrics Module
//!
//! Exposes feed metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound market frames by channel, outbound control frames by method
//! - **Connection**: Upstream status, quality score and reconnects
//! - **Subscriptions**: Active keys and handlers per channel
//! - **Dispatch**: Fan-out latency and consumer handler panics
//!
//! Recording is a no-op until [`init_metrics`] installs the recorder.
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::health::ConnectionStatus;
use crate::domain::subscription::RegistryStats;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Returns the existing handle on repeated calls.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "market_feed_frames_received_total",
        "Market frames received from upstream by channel"
    );
    describe_counter!(
        "market_feed_frames_sent_total",
        "Control frames written upstream by method"
    );
    describe_counter!(
        "market_feed_malformed_frames_total",
        "Inbound frames dropped because they could not be decoded"
    );

    // Connection
    describe_gauge!(
        "market_feed_connected",
        "Whether the upstream session is open (1) or not (0)"
    );
    describe_gauge!(
        "market_feed_quality_score",
        "Upstream connection quality score (0-100)"
    );
    describe_counter!(
        "market_feed_reconnects_total",
        "Established upstream sessions lost and retried"
    );

    // Subscriptions
    describe_gauge!(
        "market_feed_subscription_keys",
        "Active subscription keys by channel"
    );
    describe_gauge!(
        "market_feed_subscription_handlers",
        "Registered consumer handlers"
    );

    // Dispatch
    describe_histogram!(
        "market_feed_dispatch_seconds",
        "Time to fan a market event out to its handlers"
    );
    describe_counter!(
        "market_feed_handler_panics_total",
        "Consumer and listener callbacks that panicked"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a market frame received from upstream.
pub fn record_frame_received(channel: &'static str) {
    counter!("market_feed_frames_received_total", "channel" => channel).increment(1);
}

/// Record a control frame written upstream.
pub fn record_frame_sent(method: &'static str) {
    counter!("market_feed_frames_sent_total", "method" => method).increment(1);
}

/// Record a dropped malformed frame.
pub fn record_malformed_frame() {
    counter!("market_feed_malformed_frames_total").increment(1);
}

/// Record a lost session that will be retried.
pub fn record_reconnect() {
    counter!("market_feed_reconnects_total").increment(1);
}

/// Update the connection gauges.
pub fn record_connection_health(status: ConnectionStatus, score: u8) {
    gauge!("market_feed_connected").set(if status.is_connected() { 1.0 } else { 0.0 });
    gauge!("market_feed_quality_score").set(f64::from(score));
}

/// Update the subscription gauges.
#[allow(clippy::cast_precision_loss)]
pub fn record_registry_stats(stats: &RegistryStats) {
    gauge!("market_feed_subscription_keys", "channel" => "l2Book")
        .set(stats.order_book_keys as f64);
    gauge!("market_feed_subscription_keys", "channel" => "trades").set(stats.trades_keys as f64);
    gauge!("market_feed_subscription_keys", "channel" => "allMids")
        .set(stats.mid_price_keys as f64);
    gauge!("market_feed_subscription_handlers").set(stats.handlers as f64);
}

/// Record fan-out of one market event.
pub fn record_dispatch(channel: &'static str, handlers: usize, duration: Duration) {
    if handlers == 0 {
        return;
    }
    histogram!("market_feed_dispatch_seconds", "channel" => channel)
        .record(duration.as_secs_f64());
}

/// Record a consumer or listener callback that panicked.
pub fn record_handler_panic() {
    counter!("market_feed_handler_panics_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
