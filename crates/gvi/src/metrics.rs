use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::types::AssignmentResult;

/// Prometheus collectors for one pipeline process.
///
/// Wrapped in an `Arc` and shared by every worker.
pub struct PipelineMetrics {
    pub registry: Registry,
    /// Points finished, by outcome: `assigned`, `not_found`, `failed`.
    pub points_total: IntCounterVec,
    /// Per-point errors, by kind (`NetworkError`, `StorageError`, `InternalError`).
    pub point_errors_total: IntCounterVec,
    /// Wall time of one `find_nearest_unassigned` call, retries included.
    pub lookup_latency: Histogram,
    pub points_in_flight: IntGauge,
    /// Images scored, by method and outcome (`ok`, `failed`).
    pub images_scored_total: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("gvi".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            points_total: reg!(IntCounterVec::new(
                Opts::new("points_total", "Points processed by the assignment engine"),
                &["outcome"]
            )
            .expect("valid metric")),
            point_errors_total: reg!(IntCounterVec::new(
                Opts::new("point_errors_total", "Per-point errors by kind"),
                &["kind"]
            )
            .expect("valid metric")),
            lookup_latency: reg!(Histogram::with_opts(
                HistogramOpts::new(
                    "lookup_latency_seconds",
                    "Time to find, claim and retrieve an image for one point"
                )
                .buckets(prometheus::exponential_buckets(0.001, 2.0, 16).expect("valid buckets"))
            )
            .expect("valid metric")),
            points_in_flight: reg!(IntGauge::new(
                "points_in_flight",
                "Points currently being looked up"
            )
            .expect("valid metric")),
            images_scored_total: reg!(IntCounterVec::new(
                Opts::new("images_scored_total", "Images scored by method and outcome"),
                &["method", "outcome"]
            )
            .expect("valid metric")),
            registry,
        }
    }

    pub fn record_assignment(&self, result: &AssignmentResult) {
        let outcome = if result.is_assigned() {
            "assigned"
        } else if result.error.is_some() {
            "failed"
        } else {
            "not_found"
        };
        self.points_total.with_label_values(&[outcome]).inc();
        if let Some(err) = &result.error {
            self.point_errors_total.with_label_values(&[err.kind()]).inc();
        }
    }

    pub fn record_score(&self, method: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        self.images_scored_total
            .with_label_values(&[method, outcome])
            .inc();
    }

    pub fn router(&self) -> Router {
        let reg = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let reg = reg.clone();
                async move {
                    let mut buf = Vec::new();
                    if let Err(e) = TextEncoder::new().encode(&reg.gather(), &mut buf) {
                        tracing::warn!(error = %e, "Failed to encode metrics");
                    }
                    String::from_utf8_lossy(&buf).into_owned().into_response()
                }
            }),
        )
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
