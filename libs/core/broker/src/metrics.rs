//! Prometheus metrics for the producer and consumers.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

use crate::envelope::Disposition;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops; if another recorder is already
/// installed the failure is logged and metrics are simply not rendered.
pub fn init_metrics() {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });
    if let Err(e) = result {
        warn!(error = %e, "Failed to install Prometheus recorder");
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format (empty before `init_metrics`).
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

pub fn broker_connected(service: &str) {
    counter!("broker_connections_total", "service" => service.to_string()).increment(1);
}

pub fn message_enqueued(exchange: &str) {
    counter!("producer_messages_enqueued_total", "exchange" => exchange.to_string()).increment(1);
}

/// Publish refused at enqueue time; `reason` is `queue_full` or `not_running`.
pub fn message_refused(exchange: &str, reason: &'static str) {
    counter!(
        "producer_messages_refused_total",
        "exchange" => exchange.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn message_published(exchange: &str, success: bool, queued_for: Duration) {
    counter!(
        "producer_messages_published_total",
        "exchange" => exchange.to_string(),
        "status" => if success { "success" } else { "failed" }
    )
    .increment(1);

    histogram!("producer_queue_wait_seconds", "exchange" => exchange.to_string())
        .record(queued_for.as_secs_f64());
}

pub fn queue_depth(depth: usize) {
    gauge!("producer_queue_depth").set(depth as f64);
}

/// `outcome` is `recovered` or `failed`.
pub fn producer_recovery(outcome: &'static str) {
    counter!("producer_recoveries_total", "outcome" => outcome).increment(1);
}

pub fn delivery_settled(queue: &str, disposition: Disposition) {
    counter!(
        "consumer_deliveries_total",
        "queue" => queue.to_string(),
        "disposition" => disposition.to_string()
    )
    .increment(1);
}

pub fn consumers_running(count: usize) {
    gauge!("consumers_running").set(count as f64);
}

/// `outcome` is `completed` or `error`.
pub fn consumer_exited(name: &str, outcome: &'static str) {
    counter!(
        "consumer_exits_total",
        "consumer" => name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
