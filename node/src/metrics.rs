//! # Prometheus Metrics
//!
//! Operational metrics for the control-plane node, scraped at the
//! `/metrics` endpoint. All metrics live in a dedicated
//! [`prometheus::Registry`] so they cannot collide with anything a
//! library registers globally.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

use spkeasy_core::queue::TickStats;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are internally shared) so it can be
/// passed to request handlers and the worker loop alike.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Registry that owns every metric below.
    registry: Registry,
    /// Total HTTP requests served, any method, any status.
    pub http_requests_total: IntCounter,
    /// HTTP requests that ended in an error response (4xx/5xx).
    pub http_errors_total: IntCounter,
    /// Queue jobs that ran to completion.
    pub jobs_completed_total: IntCounter,
    /// Queue jobs that aborted after a re-check (no retry).
    pub jobs_aborted_total: IntCounter,
    /// Queue job failures that were rescheduled with back-off.
    pub jobs_retried_total: IntCounter,
    /// Queue jobs parked for operator attention.
    pub jobs_quarantined_total: IntCounter,
    /// Jobs currently waiting across all registered queues.
    pub jobs_pending: IntGauge,
    /// Identity verifications answered from cache.
    pub identity_cache_hits_total: IntCounter,
    /// Request handling latency in seconds.
    pub request_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("spkeasy".into()), None)
            .expect("failed to create prometheus registry");

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::new(name, help).expect("metric creation");
            registry.register(Box::new(c.clone())).expect("metric registration");
            c
        }

        let http_requests_total =
            counter(&registry, "http_requests_total", "Total HTTP requests served");
        let http_errors_total = counter(
            &registry,
            "http_errors_total",
            "HTTP requests answered with an error status",
        );
        let jobs_completed_total =
            counter(&registry, "jobs_completed_total", "Queue jobs completed");
        let jobs_aborted_total = counter(
            &registry,
            "jobs_aborted_total",
            "Queue jobs aborted after an authoritative re-check",
        );
        let jobs_retried_total = counter(
            &registry,
            "jobs_retried_total",
            "Queue job failures rescheduled with back-off",
        );
        let jobs_quarantined_total = counter(
            &registry,
            "jobs_quarantined_total",
            "Queue jobs quarantined for operator attention",
        );
        let identity_cache_hits_total = counter(
            &registry,
            "identity_cache_hits_total",
            "Identity verifications answered from the TTL cache",
        );

        let jobs_pending = IntGauge::new(
            "jobs_pending",
            "Jobs currently waiting across registered queues",
        )
        .expect("metric creation");
        registry
            .register(Box::new(jobs_pending.clone()))
            .expect("metric registration");

        let request_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "request_latency_seconds",
            "HTTP request handling latency in seconds",
        ))
        .expect("metric creation");
        registry
            .register(Box::new(request_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            http_requests_total,
            http_errors_total,
            jobs_completed_total,
            jobs_aborted_total,
            jobs_retried_total,
            jobs_quarantined_total,
            jobs_pending,
            identity_cache_hits_total,
            request_latency_seconds,
        }
    }

    /// Fold one worker tick into the job counters.
    pub fn record_tick(&self, stats: TickStats) {
        self.jobs_completed_total.inc_by(stats.completed as u64);
        self.jobs_aborted_total.inc_by(stats.aborted as u64);
        self.jobs_retried_total.inc_by(stats.retried as u64);
        self.jobs_quarantined_total.inc_by(stats.quarantined as u64);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<crate::api::AppState>,
) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_stats_land_in_counters() {
        let metrics = NodeMetrics::new();
        metrics.record_tick(TickStats {
            completed: 3,
            aborted: 1,
            retried: 2,
            quarantined: 1,
        });
        let rendered = metrics.encode().unwrap();
        assert!(rendered.contains("spkeasy_jobs_completed_total 3"));
        assert!(rendered.contains("spkeasy_jobs_aborted_total 1"));
        assert!(rendered.contains("spkeasy_jobs_retried_total 2"));
        assert!(rendered.contains("spkeasy_jobs_quarantined_total 1"));
    }
}
