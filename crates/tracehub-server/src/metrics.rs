//! Prometheus metrics for the TraceHub server.
//!
//! The coordination crate records its counters through the `metrics` facade;
//! this module installs the recorder and adds the HTTP-level admission
//! counters.

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const HTTP_REJECTIONS_TOTAL: &str = "http_admission_rejections_total";
    pub const AUTH_FAILURES_TOTAL: &str = "auth_failures_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics is served by the router
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a request turned away before reaching its handler.
pub fn record_rejection(status: u16, reason: &'static str) {
    counter!(
        names::HTTP_REJECTIONS_TOTAL,
        "status" => status.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_auth_failure(kind: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "kind" => kind).increment(1);
}
