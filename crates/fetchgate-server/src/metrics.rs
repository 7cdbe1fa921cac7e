//! Observability (C7): installs the Prometheus recorder and emits every
//! instrument named in the external contract.
//!
//! Grounded on `main.py`'s `PrometheusMiddleware` (the `http_*`
//! request/latency/size instruments recorded around every request,
//! skipping `/metrics` itself) and `apis/metrics.py`'s Counter/Histogram/
//! Gauge declarations, reimplemented with `metrics` + the
//! `metrics-exporter-prometheus` recorder instead of `prometheus_client`.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use fetchgate_core::{Engine, ProxyType};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use crate::browser::BrowserMetricsSink;
use fetchgate_engine::proxy::ProxyMetricsSink;

pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Axum middleware recording `api_requests_total`,
/// `api_request_duration_seconds`, `api_request_size_bytes`,
/// `api_response_size_bytes`, and the `api_requests_in_flight` gauge
/// around every request, mirroring `PrometheusMiddleware`'s skip of the
/// `/metrics` path itself.
pub async fn track_http_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().to_string();

    if path == "/metrics" {
        return next.run(req).await;
    }

    let request_size = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0);

    metrics::gauge!("api_requests_in_flight", "method" => method.clone(), "path" => path.clone())
        .increment(1.0);
    metrics::histogram!("api_request_size_bytes", "method" => method.clone(), "path" => path.clone())
        .record(request_size);

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    metrics::gauge!("api_requests_in_flight", "method" => method.clone(), "path" => path.clone())
        .decrement(1.0);
    metrics::counter!(
        "api_requests_total",
        "method" => method.clone(), "path" => path.clone(), "status_code" => status.clone()
    )
    .increment(1);
    metrics::histogram!(
        "api_request_duration_seconds",
        "method" => method.clone(), "path" => path.clone()
    )
    .record(elapsed);

    let response_size = response
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0);
    metrics::histogram!(
        "api_response_size_bytes",
        "method" => method, "path" => path
    )
    .record(response_size);

    response
}

pub fn record_api_error(error_type: &str) {
    metrics::counter!("api_errors_total", "error_type" => error_type.to_string()).increment(1);
}

pub fn record_cache_operation(status: &str) {
    metrics::counter!("cache_operations_total", "status" => status.to_string()).increment(1);
}

pub fn record_proxy_usage(proxy_type: ProxyType) {
    metrics::counter!("proxy_usage_total", "proxy_type" => proxy_type_label(proxy_type)).increment(1);
}

pub fn record_proxy_failure() {
    metrics::counter!("proxy_failures_total").increment(1);
}

pub fn record_proxy_retry(attempt: u32) {
    metrics::counter!("proxy_retry_total", "attempt" => attempt.to_string()).increment(1);
}

fn proxy_type_label(proxy_type: ProxyType) -> &'static str {
    match proxy_type {
        ProxyType::None => "none",
        ProxyType::Static => "static",
        ProxyType::Dynamic => "dynamic",
    }
}

/// Wires `ProxyPool`'s metrics sink trait (C3) to the real `metrics::`
/// macros, so the pool itself stays free of how Prometheus is installed.
pub struct RecorderProxyMetrics;

impl ProxyMetricsSink for RecorderProxyMetrics {
    fn observe_reuse_count(&self, proxy_type: ProxyType, reuse_count: u64) {
        metrics::histogram!("proxy_reuse_count", "proxy_type" => proxy_type_label(proxy_type))
            .record(reuse_count as f64);
    }

    fn set_current_reuse_count(&self, count: u64) {
        metrics::gauge!("proxy_current_reuse_count").set(count as f64);
    }

    fn record_switch(&self, reason: &str) {
        metrics::counter!("proxy_switch_total", "reason" => reason.to_string()).increment(1);
        record_proxy_failure();
    }
}

/// Wires the Browser Lifecycle Manager's metrics sink trait (C4) to the
/// real `metrics::` macros.
pub struct RecorderBrowserMetrics;

impl BrowserMetricsSink for RecorderBrowserMetrics {
    fn on_operation(&self, engine: Engine, operation: &str) {
        metrics::counter!(
            "browser_operations_total",
            "browser_type" => engine.as_str(), "operation" => operation.to_string()
        )
        .increment(1);
    }

    fn on_operation_status(&self, engine: Engine, operation: &str, status: &str) {
        metrics::counter!(
            "browser_operations_status_total",
            "browser_type" => engine.as_str(),
            "operation" => operation.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    fn on_reinitialization(&self, engine: Engine) {
        metrics::counter!("browser_reinitializations_total", "browser_type" => engine.as_str())
            .increment(1);
    }

    fn set_instance_gauge(&self, engine: Engine, count: u64) {
        metrics::gauge!("browser_instances", "browser_type" => engine.as_str()).set(count as f64);
    }
}

pub fn record_browser_operation_duration(engine: Engine, operation: &str, seconds: f64) {
    metrics::histogram!(
        "browser_operation_duration_seconds",
        "browser_type" => engine.as_str(), "operation" => operation.to_string()
    )
    .record(seconds);
}

pub fn record_page_status_code(engine: Engine, page_status_code: i32) {
    metrics::counter!(
        "browser_page_status_codes_total",
        "browser_type" => engine.as_str(), "page_status_code" => page_status_code.to_string()
    )
    .increment(1);
}

pub fn set_waiting_requests(n: i64) {
    metrics::gauge!("waiting_requests").set(n as f64);
}

pub fn set_processing_requests(n: i64) {
    metrics::gauge!("processing_requests").set(n as f64);
}
