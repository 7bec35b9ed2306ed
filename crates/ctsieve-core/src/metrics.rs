//! Prometheus metrics helpers for the ctsieve jobs.
//!
//! Each job installs the recorder at startup and, when a metrics port is
//! configured, serves `/metrics` for as long as the run lasts.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ctsieve_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9091, handle).await?;
//!
//! metrics::counter!("extract_entries_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: job or component (`extract_`, `rotation_`, `shard_`, `reduce_`)
//! - Suffix: unit or type (`_total`, `_bytes`)
//! - Labels: only for small closed sets such as skip reasons

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::runtime::Runtime;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:<port>` before returning, then serves `/metrics` from a
/// background task on the current runtime.
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
            tracing::warn!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Serve `/metrics` from a dedicated background runtime.
///
/// The jobs themselves are synchronous, so the exporter gets its own
/// single-worker runtime. Returns `None` when `port` is 0 or a recorder is
/// already installed. Keep the returned runtime alive for the whole run.
pub fn serve_metrics_in_background(port: u16) -> Result<Option<Runtime>, std::io::Error> {
    if port == 0 {
        return Ok(None);
    }
    let Some(handle) = init_metrics() else {
        tracing::warn!("Metrics recorder already installed, not starting exporter");
        return Ok(None);
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("metrics")
        .enable_all()
        .build()?;
    runtime.block_on(start_metrics_server(port, handle))?;
    Ok(Some(runtime))
}

/// Register descriptions for the metrics the jobs emit.
fn register_common_metrics() {
    // =========================================================================
    // Extraction
    // =========================================================================

    describe_counter!(
        "extract_entries_total",
        "Ledger entries delivered by the source"
    );
    describe_counter!(
        "extract_records_total",
        "Records emitted to the output rotator"
    );
    describe_counter!(
        "extract_skipped_total",
        "Entries dropped before emission (label: reason)"
    );
    describe_gauge!(
        "extract_running",
        "Whether an extraction run is in progress (1=yes, 0=no)"
    );

    // =========================================================================
    // Output rotation
    // =========================================================================

    describe_counter!(
        "rotation_records_written_total",
        "Lines written to rotated output files"
    );
    describe_counter!(
        "rotation_files_sealed_total",
        "Rotated output files flushed and closed"
    );

    // =========================================================================
    // Sharding
    // =========================================================================

    describe_counter!("shard_lines_total", "Record lines read by the sharder");
    describe_counter!(
        "shard_malformed_lines_total",
        "Record lines skipped as malformed"
    );
    describe_counter!(
        "shard_occurrences_total",
        "Domain occurrences written to bucket files"
    );
    describe_counter!(
        "shard_files_failed_total",
        "Input files abandoned after a read error"
    );
    describe_gauge!(
        "shard_running",
        "Whether a shard run is in progress (1=yes, 0=no)"
    );

    // =========================================================================
    // Reduction
    // =========================================================================

    describe_counter!("reduce_rows_total", "Bucket rows folded by the reducer");
    describe_counter!(
        "reduce_malformed_lines_total",
        "Bucket rows skipped as malformed"
    );
    describe_counter!(
        "reduce_domains_total",
        "Distinct domains written to result files"
    );
    describe_gauge!(
        "reduce_running",
        "Whether a reduce run is in progress (1=yes, 0=no)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        let first = init_metrics();
        let second = init_metrics();
        // At most one install can succeed
        assert!(first.is_none() || second.is_none());
    }

    #[test]
    fn test_serve_disabled_on_port_zero() {
        assert!(serve_metrics_in_background(0).unwrap().is_none());
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        let _ = init_metrics();
        register_common_metrics();
        register_common_metrics();
    }

    #[test]
    fn test_recording_without_server_does_not_panic() {
        let _ = init_metrics();
        metrics::counter!("extract_entries_total").increment(1);
        metrics::counter!("extract_skipped_total", "reason" => "cutoff").increment(1);
        metrics::gauge!("shard_running").set(1.0);
    }
}
