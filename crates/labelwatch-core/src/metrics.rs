//! Prometheus metrics helpers for the labeler.
//!
//! Centralizes recorder installation, the `/metrics` endpoint, and the
//! descriptions of every metric the pipeline records.
//!
//! # Usage
//!
//! ```rust,ignore
//! use labelwatch_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("firehose_events_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`firehose_`, `cache_`, `queue_`, `labels_`, `checkpoint_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only `cache` (cache name) and `reason`, both low-cardinality

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_labeler_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_labeler_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server on `0.0.0.0:<port>`.
///
/// Binds before returning so a port conflict surfaces as an error, then
/// serves `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for all labeler metrics.
fn register_labeler_metrics() {
    // =========================================================================
    // Firehose
    // =========================================================================

    describe_counter!("firehose_frames_total", "Frames received from the firehose");
    describe_counter!("firehose_events_total", "Commit events emitted by the ingester");
    describe_counter!(
        "firehose_decode_errors_total",
        "Frames skipped because they failed to decode"
    );
    describe_counter!(
        "firehose_duplicate_frames_total",
        "Frames dropped because their sequence was already delivered"
    );
    describe_counter!("firehose_stalls_total", "Sessions ended by stall detection");
    describe_counter!(
        "firehose_reconnects_total",
        "Firehose reconnects (label: reason)"
    );
    describe_gauge!("firehose_pending_frames", "Frames buffered ahead of decode");
    describe_gauge!("firehose_last_sequence", "Highest sequence delivered");
    describe_histogram!(
        "firehose_backpressure_seconds",
        "Time the receive loop spent throttled by buffer occupancy"
    );

    // =========================================================================
    // Batched cache
    // =========================================================================

    describe_counter!("cache_hits_total", "Cache hits (label: cache)");
    describe_counter!("cache_misses_total", "Cache misses (label: cache)");
    describe_counter!(
        "cache_coalesced_total",
        "Lookups that joined an in-flight fetch (label: cache)"
    );
    describe_counter!("cache_timeouts_total", "Lookups that timed out (label: cache)");
    describe_counter!("cache_evicted_total", "Entries evicted by scavenging (label: cache)");
    describe_counter!("cache_batches_total", "Backend batch fetches (label: cache)");
    describe_gauge!("cache_entries", "Entries currently held (label: cache)");
    describe_histogram!(
        "cache_batch_duration_seconds",
        "Backend batch fetch latency (label: cache)"
    );

    // =========================================================================
    // Commit processing queue
    // =========================================================================

    describe_gauge!("queue_depth", "Commit tasks waiting to run");
    describe_gauge!("queue_running", "Commit tasks currently running");
    describe_counter!("queue_completed_total", "Commit tasks completed");
    describe_counter!("queue_failed_total", "Commit task attempts that failed");
    describe_counter!("queue_timeouts_total", "Commit task attempts that timed out");
    describe_counter!("queue_retries_total", "Commit tasks scheduled for retry");
    describe_counter!("queue_skipped_total", "Commit tasks permanently skipped");
    describe_counter!("queue_rejected_total", "Submissions rejected before enqueue");

    // =========================================================================
    // Labels and checkpoint
    // =========================================================================

    describe_counter!("labels_queued_total", "Label operations handed to persistence");
    describe_counter!("labels_emitted_total", "Label actions emitted to the moderation API");
    describe_counter!("labels_emit_errors_total", "Failed moderation emit calls");
    describe_gauge!("checkpoint_sequence", "Last persisted firehose sequence");
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter labeled with a cache name.
#[inline]
pub fn increment_cache(name: &'static str, cache: &'static str, count: u64) {
    if count > 0 {
        metrics::counter!(name, "cache" => cache).increment(count);
    }
}

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
