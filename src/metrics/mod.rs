use crate::error::{GatewayError, Result};
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Prometheus exposition for the gateway's counters and histograms
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the process-wide Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// A handle that is not installed globally; renders nothing recorded elsewhere.
    /// Used when a recorder already exists, e.g. several gateways in one test binary.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: Arc::new(recorder.handle()),
        }
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_requests_total",
            "Requests handled, by route, target and outcome"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "End-to-end request latency in seconds"
        );
        describe_counter!(
            "gateway_passthrough_total",
            "Requests that matched no route"
        );
        describe_counter!(
            "gateway_route_cache_lookups_total",
            "Route cache lookups by result (hit, miss, stale, unavailable)"
        );
        describe_counter!(
            "gateway_rate_limit_decisions_total",
            "Rate limit decisions by algorithm (allowed, denied, fail_open)"
        );
        describe_counter!(
            "gateway_rate_limit_exceeded_total",
            "Requests rejected with 429, by route"
        );
        describe_counter!(
            "gateway_rate_limit_fail_open_total",
            "Rate limit checks that failed open, by reason"
        );
        describe_counter!(
            "gateway_mirror_requests_total",
            "Shadow copies sent to mirror targets"
        );
        describe_counter!(
            "gateway_geo_blocked_total",
            "Requests rejected because of the client's country"
        );
        describe_gauge!(
            "gateway_target_healthy",
            "Target health as seen by failover (1 = healthy, 0 = unhealthy)"
        );

        debug!("All metrics registered with descriptions");
    }

    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// `GET /metrics`
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Record a routed request
pub fn record_request(route: &str, target: &str, outcome: &str, duration: f64) {
    let labels = [
        ("route", route.to_string()),
        ("target", target.to_string()),
        ("outcome", outcome.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration);
}

pub fn record_passthrough(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    counter!("gateway_passthrough_total", &labels).increment(1);
}

/// `result` is one of hit, miss, stale, unavailable
pub fn record_route_cache_lookup(result: &str) {
    let labels = [("result", result.to_string())];
    counter!("gateway_route_cache_lookups_total", &labels).increment(1);
}

pub fn record_rate_limit_decision(algorithm: &str, decision: &str) {
    let labels = [
        ("algorithm", algorithm.to_string()),
        ("decision", decision.to_string()),
    ];
    counter!("gateway_rate_limit_decisions_total", &labels).increment(1);
}

/// Record rate limit exceeded
pub fn record_rate_limit_exceeded(route: &str) {
    let labels = [("route", route.to_string())];
    counter!("gateway_rate_limit_exceeded_total", &labels).increment(1);
}

pub fn record_rate_limit_fail_open(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!("gateway_rate_limit_fail_open_total", &labels).increment(1);
}

pub fn record_mirror_request(target: &str, outcome: &str) {
    let labels = [
        ("target", target.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("gateway_mirror_requests_total", &labels).increment(1);
}

pub fn record_geo_blocked(route: &str) {
    let labels = [("route", route.to_string())];
    counter!("gateway_geo_blocked_total", &labels).increment(1);
}

pub fn record_target_health(target: &str, healthy: bool) {
    let labels = [("target", target.to_string())];
    gauge!("gateway_target_healthy", &labels).set(if healthy { 1.0 } else { 0.0 });
}

/// Timer for one routed request
pub struct RequestTimer {
    start: Instant,
    route: String,
    target: Option<String>,
}

impl RequestTimer {
    pub fn start(route: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            route: route.into(),
            target: None,
        }
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = Some(target.into());
    }

    /// Record the elapsed time under `outcome`
    pub fn record(self, outcome: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_request(
            &self.route,
            self.target.as_deref().unwrap_or("none"),
            outcome,
            duration,
        );
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
