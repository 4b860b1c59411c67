//! Prometheus metrics for the matching engine.
//!
//! `Metrics::new` builds a registry plus the instruments the engine and
//! queue managers record into; the handle is cheap to clone. The `/metrics`
//! endpoint is served by `run_metrics_server` with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::queue_id::QueueKind;

/// Default histogram buckets for poll latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Matching metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Task flow
    tasks_added: CounterVec,
    sync_matches: CounterVec,
    tasks_persisted: CounterVec,
    tasks_expired: Counter,
    queries: Counter,

    // Poll metrics
    poll_duration: HistogramVec,

    // Manager lifecycle
    managers_active: Gauge,
    leases_lost: Counter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<Counter> {
    let metric = Counter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> anyhow::Result<CounterVec> {
    let metric = CounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<Gauge> {
    let metric = Gauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn latency_histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> anyhow::Result<HistogramVec> {
    let opts = HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec());
    let metric = HistogramVec::new(opts, labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> anyhow::Result<Metrics> {
        let registry = Registry::new();

        Ok(Metrics {
            tasks_added: counter_vec(
                &registry,
                "switchyard_tasks_added_total",
                "Total number of tasks accepted from producers",
                &["kind", "source"],
            )?,
            sync_matches: counter_vec(
                &registry,
                "switchyard_sync_matches_total",
                "Tasks delivered to a poller without a storage write",
                &["kind"],
            )?,
            tasks_persisted: counter_vec(
                &registry,
                "switchyard_tasks_persisted_total",
                "Tasks spilled to the durable backlog",
                &["kind"],
            )?,
            tasks_expired: counter(
                &registry,
                "switchyard_tasks_expired_total",
                "Backlog tasks dropped because their expiry passed",
            )?,
            queries: counter(
                &registry,
                "switchyard_queries_total",
                "QueryWorkflow requests accepted",
            )?,
            poll_duration: latency_histogram(
                &registry,
                "switchyard_poll_duration_seconds",
                "Poll wait time in seconds",
                &["kind", "outcome"],
            )?,
            managers_active: gauge(
                &registry,
                "switchyard_queue_managers_active",
                "Queue managers currently alive in this process",
            )?,
            leases_lost: counter(
                &registry,
                "switchyard_leases_lost_total",
                "Queue leases lost to another instance",
            )?,
            registry: Arc::new(registry),
        })
    }

    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_task_added(&self, kind: QueueKind, forwarded: bool) {
        let source = if forwarded { "forwarded" } else { "local" };
        self.tasks_added
            .with_label_values(&[&kind.to_string(), source])
            .inc();
    }

    pub fn record_sync_match(&self, kind: QueueKind) {
        self.sync_matches
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn record_task_persisted(&self, kind: QueueKind) {
        self.tasks_persisted
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    pub fn record_task_expired(&self) {
        self.tasks_expired.inc();
    }

    pub fn record_query(&self) {
        self.queries.inc();
    }

    pub fn record_poll(&self, kind: QueueKind, outcome: &str, elapsed: Duration) {
        self.poll_duration
            .with_label_values(&[&kind.to_string(), outcome])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_manager_started(&self) {
        self.managers_active.inc();
    }

    pub fn record_manager_stopped(&self) {
        self.managers_active.dec();
    }

    pub fn record_lease_lost(&self) {
        self.leases_lost.inc();
    }

    /// Render every registered instrument in the Prometheus text exposition
    /// format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut out = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

async fn scrape(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `/metrics` on `addr` until the shutdown signal fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "serving prometheus metrics");

    let router = Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
