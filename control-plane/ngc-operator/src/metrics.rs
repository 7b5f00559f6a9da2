//! Prometheus metrics for the operator.

use std::sync::Arc;

use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};
use ngc_cluster::{ClusterRegistry, Reachability};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    /// Reconcile passes by kind and outcome
    pub reconcile_total: IntCounterVec,
    pub reconcile_duration_seconds: HistogramVec,
    /// Child create/update/delete calls by child kind
    pub child_operations_total: IntCounterVec,
    pub queue_depth: IntGauge,
    pub cluster_reachable: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("ngc_reconcile_total", "Reconcile passes"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new("ngc_reconcile_duration_seconds", "Reconcile pass duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["kind"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let child_operations_total = IntCounterVec::new(
            Opts::new("ngc_child_operations_total", "Child resource writes"),
            &["kind", "op"],
        )?;
        registry.register(Box::new(child_operations_total.clone()))?;

        let queue_depth = IntGauge::new("ngc_queue_depth", "Keys waiting in the work queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let cluster_reachable = IntGaugeVec::new(
            Opts::new("ngc_cluster_reachable", "1 when the last probe succeeded"),
            &["cluster"],
        )?;
        registry.register(Box::new(cluster_reachable.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration_seconds,
            child_operations_total,
            queue_depth,
            cluster_reachable,
        })
    }

    pub fn child_op(&self, kind: &str, op: &str) {
        self.child_operations_total.with_label_values(&[kind, op]).inc();
    }

    /// Refresh per-cluster gauges from the registry.
    pub async fn observe_clusters(&self, registry: &ClusterRegistry) {
        self.cluster_reachable.reset();
        for c in registry.list().await {
            let v = i64::from(c.reachability() == Reachability::Reachable);
            self.cluster_reachable.with_label_values(&[c.name.as_str()]).set(v);
        }
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[derive(Clone)]
struct MetricsState {
    metrics: Arc<Metrics>,
    registry: Arc<ClusterRegistry>,
}

async fn scrape(State(state): State<MetricsState>) -> impl IntoResponse {
    state.metrics.observe_clusters(&state.registry).await;
    match state.metrics.render() {
        Ok(body) => (
            axum::http::StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub fn metrics_router(metrics: Arc<Metrics>, registry: Arc<ClusterRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(MetricsState { metrics, registry })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_families() {
        let m = Metrics::new().unwrap();
        m.reconcile_total.with_label_values(&["InferenceStack", "ok"]).inc();
        m.child_op("HTTPRoute", "create");
        m.queue_depth.set(3);
        let text = m.render().unwrap();
        assert!(text.contains("ngc_reconcile_total{kind=\"InferenceStack\",outcome=\"ok\"} 1"));
        assert!(text.contains("ngc_child_operations_total{kind=\"HTTPRoute\",op=\"create\"} 1"));
        assert!(text.contains("ngc_queue_depth 3"));
    }
}
