//! Metrics collection and exposition.
//!
//! # Metrics
//! - `keepalive_probes_total` (counter): probe outcomes by status
//! - `keepalive_connections_closed_total` (counter): engine closures by reason
//! - `keepalive_policy_reloads_total` (counter): accepted policy reloads
//! - `upstream_connections_active` (gauge): live pooled connections per upstream
//!
//! Recording is a no-op until a recorder is installed, so library code and
//! tests can call these freely.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_probe(status: &'static str) {
    counter!("keepalive_probes_total", "status" => status).increment(1);
}

pub fn record_connection_closed(reason: &'static str) {
    counter!("keepalive_connections_closed_total", "reason" => reason).increment(1);
}

pub fn record_policy_reload() {
    counter!("keepalive_policy_reloads_total").increment(1);
}

pub fn record_active_connections(upstream: &str, count: usize) {
    gauge!("upstream_connections_active", "upstream" => upstream.to_string()).set(count as f64);
}
