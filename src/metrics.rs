use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    backend_errors_total: IntCounterVec,
    cache_lookups_total: IntCounterVec,
    stream_events_total: IntCounterVec,
}

/// Counts one in-flight request until dropped; owns its gauge so a response stream can hold it.
pub struct InflightGuard {
    gauge: IntGauge,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "debate_http_requests_total",
                "Total HTTP requests processed by the debate service"
            ),
            &["path", "method", "status"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "debate_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "debate_inflight_requests",
            "Current in-flight HTTP requests",
        )
        .expect("valid inflight_requests metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "debate_backend_errors_total",
                "Error responses produced per backend id"
            ),
            &["backend"],
        )
        .expect("valid backend_errors_total metric");

        let cache_lookups_total = IntCounterVec::new(
            opts!(
                "debate_cache_lookups_total",
                "Response cache lookups by outcome"
            ),
            &["outcome"],
        )
        .expect("valid cache_lookups_total metric");

        let stream_events_total = IntCounterVec::new(
            opts!(
                "debate_stream_events_total",
                "Stream events delivered to consumers by kind"
            ),
            &["kind"],
        )
        .expect("valid stream_events_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(cache_lookups_total.clone()))
            .expect("register cache_lookups_total");
        registry
            .register(Box::new(stream_events_total.clone()))
            .expect("register stream_events_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            backend_errors_total,
            cache_lookups_total,
            stream_events_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard {
        self.inflight_requests.inc();
        InflightGuard {
            gauge: self.inflight_requests.clone(),
        }
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_error(&self, backend: &str) {
        self.backend_errors_total.with_label_values(&[backend]).inc();
    }

    pub fn observe_cache(&self, outcome: &str) {
        self.cache_lookups_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_stream_event(&self, kind: &str) {
        self.stream_events_total.with_label_values(&[kind]).inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
