use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder (once per process) and describe every series.
    pub fn init() -> anyhow::Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| {
                // Default buckets; avoids API differences across crate versions.
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("prometheus: install recorder")
            })?
            .clone();
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "bus_publish_total",
            "Bus publish attempts by outcome (accepted|invalid|rate_limited|duplicate)."
        );
        describe_counter!("normalize_failed_total", "Payloads that did not map to a valid item.");
        describe_counter!("scheduler_fetch_total", "Feed fetches by outcome status.");
        describe_counter!("scheduler_new_items_total", "Feed entries not seen before.");
        describe_gauge!("scheduler_host_interval_secs", "Current poll interval per host.");
        describe_histogram!("scheduler_parse_ms", "Feed parse time in milliseconds.");
        describe_counter!("adapter_messages_total", "Frames/lines received per push adapter.");
        describe_counter!("adapter_errors_total", "Transport or decode errors per push adapter.");
        describe_counter!(
            "adapter_queue_dropped_total",
            "Items dropped by an adapter's local queue (drop-oldest)."
        );
        describe_counter!("webhook_requests_total", "Inbound webhook requests by result.");
        describe_gauge!("hub_clients", "Connected stream clients.");
    });
}
