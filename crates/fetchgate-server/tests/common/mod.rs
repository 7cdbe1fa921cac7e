//! Test doubles shared across the end-to-end scenario tests: a
//! `BrowserDriver` stub scripted per-call instead of spawning
//! node/playwright, and a helper wiring it into a real `Orchestrator`.

use async_trait::async_trait;
use fetchgate_core::WaitUntil;
use fetchgate_engine::driver::{BrowserDriver, DriverError, NavigateOutcome};
use fetchgate_engine::history::{HistoryStore, SqliteHistoryStore};
use fetchgate_engine::proxy::{NoopProxyMetrics, ProxyPool, ProxySource, ProxySourceConfig};
use fetchgate_server::browser::{BrowserLifecycleManager, NoopBrowserMetrics};
use fetchgate_server::orchestrator::Orchestrator;
use fetchgate_server::state_machine::FetchDeps;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One scripted response to a `goto` call.
pub enum ScriptedGoto {
    Ok(u16),
    Timeout,
    Error(&'static str),
}

/// Stub `BrowserDriver`: `goto` and `content` are fed from fixed queues,
/// everything else succeeds with a fresh incrementing id. Reused across
/// every `get_or_create` call regardless of `engine` — the scenarios here
/// don't depend on per-engine driver identity.
pub struct FakeDriver {
    goto_script: Mutex<VecDeque<ScriptedGoto>>,
    content_script: Mutex<VecDeque<String>>,
    default_content: String,
    next_id: AtomicU64,
    pub goto_calls: AtomicU64,
}

impl FakeDriver {
    pub fn new(goto: Vec<ScriptedGoto>, content: Vec<&str>) -> Arc<Self> {
        let leafy: String = (0..40).map(|i| format!("<span>{i}</span>")).collect();
        Arc::new(Self {
            goto_script: Mutex::new(goto.into()),
            content_script: Mutex::new(content.into_iter().map(str::to_string).collect()),
            default_content: format!("<html><body>{leafy}</body></html>"),
            next_id: AtomicU64::new(0),
            goto_calls: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn new_context(&self, _proxy: Option<&str>) -> Result<String, DriverError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ctx{id}"))
    }

    async fn new_page(&self, _context_id: &str) -> Result<String, DriverError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("pg{id}"))
    }

    async fn set_extra_headers(
        &self,
        _page_id: &str,
        _headers: &BTreeMap<String, String>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn goto(
        &self,
        _page_id: &str,
        _url: &str,
        _timeout_ms: u64,
        _wait_until: WaitUntil,
        _viewport: Option<(u32, u32)>,
    ) -> Result<NavigateOutcome, DriverError> {
        self.goto_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.goto_script.lock().await;
        Ok(match script.pop_front() {
            Some(ScriptedGoto::Ok(status)) => NavigateOutcome::Ok { status },
            Some(ScriptedGoto::Timeout) => NavigateOutcome::Timeout,
            Some(ScriptedGoto::Error(message)) => NavigateOutcome::Error {
                message: message.to_string(),
            },
            None => NavigateOutcome::Ok { status: 200 },
        })
    }

    async fn content(&self, _page_id: &str) -> Result<String, DriverError> {
        let mut script = self.content_script.lock().await;
        Ok(script.pop_front().unwrap_or_else(|| self.default_content.clone()))
    }

    async fn screenshot_base64(&self, _page_id: &str, _full_page: bool) -> Result<String, DriverError> {
        Ok("aGVsbG8=".to_string())
    }

    async fn close_page(&self, _page_id: &str) {}
    async fn close_context(&self, _context_id: &str) {}
    async fn kill(&self) {}
}

/// Build an `Orchestrator` wired to `driver` for every engine, an
/// in-memory history store, and a no-proxy pool — enough for the
/// scenarios that don't exercise the proxy source directly.
pub async fn orchestrator_with_driver(driver: Arc<FakeDriver>) -> Orchestrator {
    orchestrator_with(driver, ProxySourceConfig {
        proxy_type: fetchgate_core::ProxyType::None,
        proxy_api_url: None,
        proxy_check_url: None,
        static_proxy: None,
    })
    .await
}

pub async fn orchestrator_with(
    driver: Arc<FakeDriver>,
    proxy_config: ProxySourceConfig,
) -> Orchestrator {
    let browsers = Arc::new(BrowserLifecycleManager::with_factory(
        Duration::from_secs(300),
        Arc::new(NoopBrowserMetrics),
        move |_engine| driver.clone() as Arc<dyn BrowserDriver>,
    ));
    let proxy_type = proxy_config.proxy_type;
    let proxy_source = ProxySource::new(reqwest::Client::new(), proxy_config);
    let proxy_pool = Arc::new(ProxyPool::new(proxy_source, Box::new(NoopProxyMetrics)));
    let deps = FetchDeps {
        browsers,
        proxy_pool,
        proxy_type,
    };
    let history: Arc<dyn HistoryStore> =
        Arc::new(SqliteHistoryStore::connect("sqlite::memory:").await.unwrap());
    Orchestrator::new(10, deps, history)
}
