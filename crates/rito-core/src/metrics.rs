//! Prometheus metrics helpers for the Rito indexer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rito_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle, axum::Router::new()).await.unwrap();
//!
//!     metrics::counter!("jetstream_events_received_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`jetstream_`, `pipeline_`, `enrich_`, `store_`, `cursor_`)
//! - Suffix: unit or type (`_total`, `_seconds`, `_micros`)
//! - Labels: low cardinality only (collection, reason, step)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the diagnostics HTTP server.
///
/// Serves `/metrics` plus whatever routes `extra` carries (the ingester adds
/// `/health` and `/status`). Binding happens before this returns so a port
/// conflict is reported to the caller; serving runs on a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
    extra: Router,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .merge(extra);

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

fn register_common_metrics() {
    // =========================================================================
    // Jetstream transport
    // =========================================================================

    describe_counter!(
        "jetstream_events_received_total",
        "Envelopes received from Jetstream or a replay source"
    );
    describe_counter!(
        "jetstream_decode_errors_total",
        "Frames that could not be decoded as a Jetstream envelope"
    );
    describe_counter!(
        "jetstream_reconnects_total",
        "Reconnect attempts after a connection loss or handler failure"
    );
    describe_gauge!(
        "jetstream_connected",
        "Whether the websocket is currently connected (1=yes, 0=no)"
    );
    describe_gauge!(
        "ingestion_running",
        "Whether the ingestion daemon is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Pipeline
    // =========================================================================

    describe_counter!(
        "pipeline_events_ignored_total",
        "Events dropped by the router (label: reason)"
    );
    describe_counter!(
        "pipeline_events_rejected_total",
        "Records rejected by validation (labels: collection, reason)"
    );
    describe_counter!(
        "pipeline_events_committed_total",
        "Events whose index writes committed (labels: collection, operation)"
    );
    describe_counter!(
        "pipeline_events_stale_total",
        "Writes skipped because a newer row or tombstone exists"
    );
    describe_counter!(
        "pipeline_identity_events_total",
        "Identity events applied to the handle table"
    );
    describe_counter!(
        "pipeline_account_events_total",
        "Account status events observed (label: active)"
    );
    describe_histogram!(
        "pipeline_event_duration_seconds",
        "Time from receiving an event to committing it"
    );

    // =========================================================================
    // Enrichment
    // =========================================================================

    describe_counter!(
        "enrich_failures_total",
        "Enrichment steps that failed or timed out (label: step)"
    );
    describe_counter!(
        "enrich_ogp_skipped_total",
        "Link preview fetches skipped because stored data was reused"
    );
    describe_counter!(
        "enrich_blocked_total",
        "Bookmarks whose subject matched the domain blocklist"
    );

    // =========================================================================
    // Storage / cursor
    // =========================================================================

    describe_counter!(
        "store_errors_total",
        "Persistence failures that stalled the stream"
    );
    describe_counter!(
        "cursor_checkpoints_total",
        "Cursor checkpoints written"
    );
    describe_gauge!(
        "cursor_position_micros",
        "Last checkpointed cursor (microseconds since epoch)"
    );
    describe_gauge!(
        "cursor_lag_seconds",
        "Seconds between now and the last committed event"
    );
    describe_counter!(
        "store_tombstones_pruned_total",
        "Tombstones removed by retention pruning"
    );
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
