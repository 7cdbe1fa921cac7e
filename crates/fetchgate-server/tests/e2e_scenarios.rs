//! End-to-end coverage of the six fetch scenarios the Fetch State
//! Machine is built around, run against the `FakeDriver` stub in
//! `common` rather than a real node/playwright process.

mod common;

use common::{orchestrator_with, orchestrator_with_driver, FakeDriver, ScriptedGoto};
use fetchgate_core::{synthetic_status, Engine, EngineOrDefault, FetchRequest, WaitUntil};
use fetchgate_engine::proxy::ProxySourceConfig;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

fn req(url: &str) -> FetchRequest {
    FetchRequest {
        url: url.to_string(),
        engine: EngineOrDefault::default(),
        timeout_ms: 10_000,
        wait_until: WaitUntil::default(),
        extra_headers: BTreeMap::new(),
        use_cache: true,
        force_content_on_timeout: false,
        skip_proxy_page_heuristic: false,
        viewport_w: None,
        viewport_h: None,
        full_page: false,
    }
}

/// Scenario 1: a plain successful navigation returns the page's real
/// status code and HTML, uncached.
#[tokio::test]
async fn scenario_1_plain_success() {
    let driver = FakeDriver::new(vec![ScriptedGoto::Ok(200)], vec![]);
    let orch = orchestrator_with_driver(driver).await;

    let result = orch.fetch_html(&req("https://example.com/ok")).await.unwrap();

    assert_eq!(result.page_status_code, 200);
    assert!(result.html.is_some());
    assert!(!result.cache_hit);
    assert!(result.page_error.is_empty());
}

/// Scenario 2: a timeout with `force_content_on_timeout` set returns the
/// synthetic 600 status and whatever content the page had at the time.
#[tokio::test]
async fn scenario_2_timeout_forced_content() {
    let driver = FakeDriver::new(vec![ScriptedGoto::Timeout], vec!["<html>partial</html>"]);
    let orch = orchestrator_with_driver(driver).await;

    let mut request = req("https://example.com/slow");
    request.force_content_on_timeout = true;
    let result = orch.fetch_html(&request).await.unwrap();

    assert_eq!(result.page_status_code, synthetic_status::TIMEOUT_FORCED_CONTENT);
    assert_eq!(result.html.as_deref(), Some("<html>partial</html>"));
}

/// Scenario 3: a proxy transport error on every attempt is retried
/// `MAX_PROXY_RETRY_ATTEMPTS` times, then surfaces 604 with the literal
/// "Proxy error after 3 retries" prefix. Routed through a dynamic proxy
/// source backed by a real ephemeral HTTP server, exercising both stubs
/// named in this scenario.
#[tokio::test]
async fn scenario_3_proxy_exception_exhausted() {
    let (addr, _stub) = spawn_proxy_stub().await;
    let driver = FakeDriver::new(
        vec![
            ScriptedGoto::Error("net::ERR_TUNNEL_CONNECTION_FAILED"),
            ScriptedGoto::Error("net::ERR_TUNNEL_CONNECTION_FAILED"),
            ScriptedGoto::Error("net::ERR_TUNNEL_CONNECTION_FAILED"),
            ScriptedGoto::Error("net::ERR_TUNNEL_CONNECTION_FAILED"),
        ],
        vec![],
    );
    let orch = orchestrator_with(
        driver,
        ProxySourceConfig {
            proxy_type: fetchgate_core::ProxyType::Dynamic,
            proxy_api_url: Some(format!("http://{addr}/proxy")),
            proxy_check_url: None,
            static_proxy: None,
        },
    )
    .await;

    let result = orch.fetch_html(&req("https://example.com/tunneled")).await.unwrap();

    assert_eq!(result.page_status_code, synthetic_status::PROXY_EXCEPTION_EXHAUSTED);
    assert!(
        result.page_error.starts_with("Proxy error after 3 retries"),
        "unexpected page_error: {}",
        result.page_error
    );
}

/// Scenario 4: a proxy that serves its own error page (HTTP 200, wrong
/// body) is retried the same way and surfaces 605 once exhausted.
#[tokio::test]
async fn scenario_4_proxy_page_exhausted() {
    let leafy: String = (0..40).map(|i| format!("<span>{i}</span>")).collect();
    let proxy_page = format!("<html><body>{leafy}Proxy Error</body></html>");
    let driver = FakeDriver::new(
        vec![
            ScriptedGoto::Ok(200),
            ScriptedGoto::Ok(200),
            ScriptedGoto::Ok(200),
            ScriptedGoto::Ok(200),
        ],
        vec![
            proxy_page.as_str(),
            proxy_page.as_str(),
            proxy_page.as_str(),
            proxy_page.as_str(),
        ],
    );
    let orch = orchestrator_with_driver(driver).await;

    let result = orch.fetch_html(&req("https://example.com/blocked")).await.unwrap();

    assert_eq!(result.page_status_code, synthetic_status::PROXY_PAGE_EXHAUSTED);
    assert!(
        result.page_error.starts_with("Proxy error after 3 retries"),
        "unexpected page_error: {}",
        result.page_error
    );
}

/// Scenario 5: a second fetch of the same URL/engine within the
/// freshness window is served from history without touching the driver.
#[tokio::test]
async fn scenario_5_cache_hit_reuses_history() {
    let driver = FakeDriver::new(vec![ScriptedGoto::Ok(200)], vec![]);
    let driver_handle = driver.clone();
    let orch = orchestrator_with_driver(driver).await;

    let first = orch.fetch_html(&req("https://example.com/cacheable")).await.unwrap();
    assert!(!first.cache_hit);

    let second = orch.fetch_html(&req("https://example.com/cacheable")).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.html, first.html);
    assert_eq!(driver_handle.goto_calls.load(Ordering::SeqCst), 1);
}

/// Scenario 6: a stale-browser error recycles the driver once and
/// retries the same navigation, succeeding on the second attempt.
#[tokio::test]
async fn scenario_6_stale_browser_recovery() {
    let driver = FakeDriver::new(
        vec![
            ScriptedGoto::Error("Target closed: browser has been closed"),
            ScriptedGoto::Ok(200),
        ],
        vec![],
    );
    let orch = orchestrator_with_driver(driver).await;

    let mut request = req("https://example.com/flaky-browser");
    request.engine = EngineOrDefault(Engine::Firefox);
    let result = orch.fetch_html(&request).await.unwrap();

    assert_eq!(result.page_status_code, 200);
    assert!(result.html.is_some());
}

async fn spawn_proxy_stub() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    use axum::routing::get;
    use axum::Router;

    let app = Router::new().route("/proxy", get(|| async { "http://upstream.example:3128" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, handle)
}
