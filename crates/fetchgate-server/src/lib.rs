//! Library surface for the fetchgate gateway: config, the Browser
//! Lifecycle Manager, the Fetch State Machine, the Request Orchestrator,
//! observability wiring, and the axum route table. `main.rs` is a thin
//! CLI wrapper around [`build_router`] and [`AppState::build`].

pub mod browser;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod routes;
pub mod state_machine;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use fetchgate_engine::history::{HistoryStore, SqliteHistoryStore};
use fetchgate_engine::proxy::{NoopProxyMetrics, ProxyPool, ProxySource, ProxySourceConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;

use browser::BrowserLifecycleManager;
use config::Config;
use metrics::RecorderBrowserMetrics;
use orchestrator::Orchestrator;
use state_machine::FetchDeps;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub browsers: Arc<BrowserLifecycleManager>,
    pub metrics_handle: PrometheusHandle,
    pub auth_bearer_token: Option<String>,
    pub html_sanitizer_url: Option<String>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub async fn build(config: &Config, metrics_handle: PrometheusHandle) -> anyhow::Result<Arc<Self>> {
        let browsers = Arc::new(BrowserLifecycleManager::new(
            config.browser_idle_timeout,
            Arc::new(RecorderBrowserMetrics),
        ));
        browser::spawn_idle_reaper(browsers.clone(), Duration::from_secs(60));

        let proxy_type = match config.proxy_type {
            config::ProxyType::None => fetchgate_core::ProxyType::None,
            config::ProxyType::Static => fetchgate_core::ProxyType::Static,
            config::ProxyType::Dynamic => fetchgate_core::ProxyType::Dynamic,
        };
        let proxy_source = ProxySource::new(
            reqwest_client()?,
            ProxySourceConfig {
                proxy_type,
                proxy_api_url: config.proxy_api_url.clone(),
                proxy_check_url: config.proxy_check_url.clone(),
                static_proxy: config.static_proxy.clone(),
            },
        );
        let proxy_metrics: Box<dyn fetchgate_engine::proxy::ProxyMetricsSink> =
            if std::env::var("FETCHGATE_DISABLE_METRICS").is_ok() {
                Box::new(NoopProxyMetrics)
            } else {
                Box::new(metrics::RecorderProxyMetrics)
            };
        let proxy_pool = Arc::new(ProxyPool::new(proxy_source, proxy_metrics));

        let history: Arc<dyn HistoryStore> =
            Arc::new(SqliteHistoryStore::connect(&config.database_url).await?);

        let deps = FetchDeps {
            browsers: browsers.clone(),
            proxy_pool,
            proxy_type,
        };
        let orchestrator = Arc::new(Orchestrator::new(
            config.max_concurrent_requests,
            deps,
            history,
        ));

        Ok(Arc::new(Self {
            orchestrator,
            browsers,
            metrics_handle,
            auth_bearer_token: config.auth_bearer_token.clone(),
            html_sanitizer_url: config.html_sanitizer_url.clone(),
            http_client: reqwest_client()?,
        }))
    }

    pub async fn shutdown(&self) {
        self.browsers.shutdown_all().await;
    }
}

fn reqwest_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/service/html", post(routes::fetch_html))
        .route("/service/screenshot", post(routes::fetch_screenshot))
        .route("/service/clean_html", post(routes::clean_html_route))
        .route("/service/health/liveness", get(routes::liveness))
        .route("/service/health/readiness", get(routes::readiness))
        .route("/service/browsers/supported", get(routes::browsers_supported))
        .route("/metrics", get(routes::metrics_endpoint))
        .layer(middleware::from_fn(metrics::track_http_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .with_state(state)
}

/// `service_mcp_bearer_token` reused here as the gateway's own bearer
/// token; an empty/unset token disables auth entirely (§2 ambient
/// config), matching `auth_config == 0` in the original settings.
#[cfg(test)]
mod tests {
    use super::*;
    use config::ProxyType;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn minimal_config() -> Config {
        Config {
            proxy_type: ProxyType::None,
            proxy_api_url: None,
            proxy_check_url: None,
            static_proxy: None,
            database_url: "sqlite::memory:".to_string(),
            max_concurrent_requests: 4,
            auth_bearer_token: None,
            bind_addr: "127.0.0.1:0".to_string(),
            browser_idle_timeout: Duration::from_secs(60),
            html_sanitizer_url: None,
        }
    }

    #[tokio::test]
    async fn app_state_builds_from_a_minimal_config_with_no_browsers_live_yet() {
        let config = minimal_config();
        let (_recorder, handle) = PrometheusBuilder::new().build().unwrap();
        let state = AppState::build(&config, handle).await.unwrap();
        assert_eq!(state.browsers.instance_count().await, 0);
        assert!(state.auth_bearer_token.is_none());
    }

    #[tokio::test]
    async fn liveness_is_reachable_through_the_full_router_unauthenticated() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let mut config = minimal_config();
        config.auth_bearer_token = Some("secret".to_string());
        let (_recorder, handle) = PrometheusBuilder::new().build().unwrap();
        let state = AppState::build(&config, handle).await.unwrap();
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/service/health/liveness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_reject_requests_missing_the_bearer_token() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let mut config = minimal_config();
        config.auth_bearer_token = Some("secret".to_string());
        let (_recorder, handle) = PrometheusBuilder::new().build().unwrap();
        let state = AppState::build(&config, handle).await.unwrap();
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/service/browsers/supported")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}

async fn require_bearer_token(
    State(state): axum::extract::State<Arc<AppState>>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.auth_bearer_token else {
        return next.run(req).await;
    };
    let path = req.uri().path();
    if path == "/service/health/liveness" || path == "/metrics" {
        return next.run(req).await;
    }
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response()
    }
}
