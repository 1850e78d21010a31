//! Prometheus recorder for the dispatch and access metrics.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls are no-ops, so every test
/// app in one process can call it.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        let handle = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "Metrics recorder already installed");
                PrometheusBuilder::new().build_recorder().handle()
            }
        };
        describe();
        handle
    });
}

fn describe() {
    describe_counter!("dispatch_requests_total", "Outbound dispatches by target, transport and outcome");
    describe_histogram!("dispatch_duration_seconds", "Outbound dispatch latency");
    describe_counter!("dispatch_fallbacks_total", "Tunneled dispatches retried over HTTP");
    describe_counter!("health_probes_total", "Tunnel health probes by target and result");
    describe_gauge!("tunnel_live_tasks", "Tunneled calls currently executing");
    describe_counter!("http_requests_total", "Served requests by transport, method and status");
    describe_histogram!("http_request_duration_seconds", "Served request latency");
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}
