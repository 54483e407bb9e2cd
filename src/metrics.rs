//! Metrics initialization for Prometheus exporter.

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::Result;

const QUERIES_TOTAL: &str = "dnsgate_queries_total";
const POLICY_ERRORS_TOTAL: &str = "dnsgate_policy_errors_total";
const DISPATCH_REJECTED_TOTAL: &str = "dnsgate_dispatch_rejected_total";
const SESSION_RECONNECTS_TOTAL: &str = "dnsgate_session_reconnects_total";

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape.
///
/// When metrics are disabled, this is a no-op. The `metrics` crate
/// handles unregistered metrics gracefully (they become no-ops).
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| crate::error::Error::Metrics(err.to_string()))?;

    Ok(())
}

/// Count an answered query, labelled `allowed` or `blocked`.
pub fn record_query(allowed: bool) {
    let decision = if allowed { "allowed" } else { "blocked" };
    counter!(QUERIES_TOTAL, "decision" => decision).increment(1);
}

pub fn record_policy_error() {
    counter!(POLICY_ERRORS_TOTAL).increment(1);
}

pub fn record_dispatch_rejected() {
    counter!(DISPATCH_REJECTED_TOTAL).increment(1);
}

pub fn record_reconnect() {
    counter!(SESSION_RECONNECTS_TOTAL).increment(1);
}
