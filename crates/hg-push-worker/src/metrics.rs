use crate::error::Result;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics for the consumer
pub struct WorkerMetrics {
    pub registry: Registry,

    // Messages by kind and disposition
    pub messages_total: IntCounterVec,

    pub handler_duration: Histogram,

    // Current value of the shared retry counter
    pub retries: IntGauge,

    pub escalations_total: IntCounter,
    pub report_failures_total: IntCounter,
}

impl WorkerMetrics {
    /// Metric names get `<namespace>_` in front when a namespace is given
    pub fn new(namespace: Option<&str>) -> Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            let opts = Opts::new(name, help);
            match namespace {
                Some(ns) => opts.namespace(ns),
                None => opts,
            }
        };

        let messages_total = IntCounterVec::new(
            opts("hg_messages_total", "Messages received by kind and outcome"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let mut duration_opts = HistogramOpts::new(
            "hg_push_handler_duration_seconds",
            "Push handler call duration in seconds",
        );
        if let Some(ns) = namespace {
            duration_opts = duration_opts.namespace(ns);
        }
        let handler_duration = Histogram::with_opts(duration_opts)?;
        registry.register(Box::new(handler_duration.clone()))?;

        let retries = IntGauge::with_opts(opts(
            "hg_push_retries",
            "Consecutive push handler failures",
        ))?;
        registry.register(Box::new(retries.clone()))?;

        let escalations_total = IntCounter::with_opts(opts(
            "hg_push_escalations_total",
            "Times the retry ceiling was exceeded",
        ))?;
        registry.register(Box::new(escalations_total.clone()))?;

        let report_failures_total = IntCounter::with_opts(opts(
            "hg_error_report_failures_total",
            "Error reports that could not be delivered",
        ))?;
        registry.register(Box::new(report_failures_total.clone()))?;

        Ok(WorkerMetrics {
            registry,
            messages_total,
            handler_duration,
            retries,
            escalations_total,
            report_failures_total,
        })
    }

    /// Count a message outcome
    pub fn inc_messages(&self, kind: &str, outcome: &str) {
        self.messages_total.with_label_values(&[kind, outcome]).inc();
    }

    pub fn set_retries(&self, retries: u32) {
        self.retries.set(i64::from(retries));
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Serve `/metrics` until the task is dropped
pub async fn serve(metrics: Arc<WorkerMetrics>, port: u16) -> anyhow::Result<()> {
    async fn metrics_handler(State(metrics): State<Arc<WorkerMetrics>>) -> (StatusCode, String) {
        (StatusCode::OK, metrics.render())
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_prefix() {
        let metrics = WorkerMetrics::new(Some("elmo")).unwrap();
        metrics.inc_messages("hg-push", "acked");
        metrics.set_retries(3);

        let text = metrics.render();
        assert!(text.contains("elmo_hg_messages_total{kind=\"hg-push\",outcome=\"acked\"} 1"));
        assert!(text.contains("elmo_hg_push_retries 3"));
    }

    #[test]
    fn test_without_namespace() {
        let metrics = WorkerMetrics::new(None).unwrap();
        metrics.escalations_total.inc();

        let text = metrics.render();
        assert!(text.contains("hg_push_escalations_total 1"));
        assert!(!text.contains("elmo_"));
    }
}
