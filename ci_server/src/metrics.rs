//! Prometheus metrics for CI runner observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a hook request and how it was handled.
pub fn hook_received(result: &str) {
    counter!("ci_hooks_received_total", "result" => result.to_string()).increment(1);
}

/// Record a build state transition.
pub fn build_status_changed(state: &str) {
    counter!("ci_builds_total", "state" => state.to_string()).increment(1);
}

/// Record how long a build script ran.
pub fn build_duration(duration_ms: u64) {
    histogram!("ci_build_duration_ms").record(duration_ms as f64);
}

/// Set the number of builds currently running.
pub fn running_builds(count: usize) {
    gauge!("ci_running_builds").set(count as f64);
}

/// Track live output readers attached over HTTP.
pub fn stream_reader_attached() {
    gauge!("ci_stream_readers").increment(1.0);
}

pub fn stream_reader_detached() {
    gauge!("ci_stream_readers").decrement(1.0);
}
