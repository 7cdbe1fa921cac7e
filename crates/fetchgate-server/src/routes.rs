//! HTTP surface: `/service/html`, `/service/screenshot`,
//! `/service/clean_html`, the liveness/readiness probes,
//! `/service/browsers/supported`, and `/metrics`.
//!
//! Grounded on `main.py`'s FastAPI route table and the `UrlInput` /
//! `HtmlResponse` / `CleanHtmlInput` / `CleanHtmlResponse` schemas in
//! `schemas/service_schema.py`.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fetchgate_core::{CleanHtmlRequest, CleanHtmlResponse, Engine, FetchRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::str::FromStr;

use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

pub async fn fetch_html(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchRequest>,
) -> Response {
    match state.orchestrator.fetch_html(&req).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            crate::metrics::record_api_error("fetch_html");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

pub async fn fetch_screenshot(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchRequest>,
) -> Response {
    match state.orchestrator.fetch_screenshot(&req).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            crate::metrics::record_api_error("fetch_screenshot");
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

/// HTML sanitization is out of scope for this gateway; this route only
/// delegates to whatever external sanitizer `service_html_sanitizer_url`
/// names.
pub async fn clean_html_route(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CleanHtmlRequest>,
) -> Response {
    let Some(url) = &state.html_sanitizer_url else {
        return error_response(
            StatusCode::NOT_IMPLEMENTED,
            "html sanitization is delegated to an external service; set service_html_sanitizer_url",
        );
    };
    match state.http_client.post(url).json(&req).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<CleanHtmlResponse>().await {
            Ok(body) => Json(body).into_response(),
            Err(e) => error_response(
                StatusCode::BAD_GATEWAY,
                format!("sanitizer returned an unexpected body: {e}"),
            ),
        },
        Ok(resp) => error_response(
            StatusCode::BAD_GATEWAY,
            format!("sanitizer responded with {}", resp.status()),
        ),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, format!("sanitizer request failed: {e}")),
    }
}

pub async fn liveness() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ReadinessParams {
    browser_type: Option<String>,
}

/// `200` iff the named `browser_type` (default `chromium`) already has a
/// live driver instance, else `503` — readiness tracks one specific
/// engine, not "the service started".
pub async fn readiness(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReadinessParams>,
) -> Response {
    let engine = match params
        .browser_type
        .as_deref()
        .map(Engine::from_str)
        .unwrap_or(Ok(Engine::Chromium))
    {
        Ok(e) => e,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let ready = state.browsers.is_initialized(engine).await;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(serde_json::json!({ "status": if ready { "ready" } else { "not_ready" }, "browser_type": engine.as_str() })),
    )
        .into_response()
}

/// The engines actually live in the Browser Lifecycle Manager right now —
/// no static `Engine::all()` list.
pub async fn browsers_supported(State(state): State<Arc<AppState>>) -> Response {
    let engines: Vec<&'static str> = state
        .browsers
        .live_engines()
        .await
        .iter()
        .map(|e| e.as_str())
        .collect();
    Json(serde_json::json!({ "browsers": engines })).into_response()
}

pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
