//! Browser Lifecycle Manager (C4): one long-lived driver process per
//! engine, created lazily, reaped when idle, and recovered once when it
//! reports itself closed.
//!
//! Grounded on `browser_manager.py`'s `BrowserManager` (lazy
//! `_create_browser` / `cleanup_all_browsers`) and `chrome_browser.py`'s
//! crashed-browser detection via matching on "has been closed" /
//! "browser has been closed" / "the handler is closed" in the driver
//! error message, with a single automatic recreate-and-retry.

use fetchgate_core::Engine;
use fetchgate_engine::driver::{BrowserDriver, BrowserDriverProcess, DriverError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Message fragments that indicate the driver process died out from
/// under us rather than the navigation itself failing.
const STALE_PATTERNS: &[&str] = &[
    "has been closed",
    "browser has been closed",
    "the handler is closed",
];

pub fn is_stale_browser_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    STALE_PATTERNS.iter().any(|p| lower.contains(p))
}

pub trait BrowserMetricsSink: Send + Sync {
    fn on_operation(&self, _engine: Engine, _operation: &str) {}
    fn on_operation_status(&self, _engine: Engine, _operation: &str, _status: &str) {}
    fn on_reinitialization(&self, _engine: Engine) {}
    fn set_instance_gauge(&self, _engine: Engine, _count: u64) {}
}

pub struct NoopBrowserMetrics;
impl BrowserMetricsSink for NoopBrowserMetrics {}

pub struct ManagedBrowser {
    pub driver: Arc<dyn BrowserDriver>,
    last_used: Mutex<Instant>,
}

impl ManagedBrowser {
    pub async fn touch(&self) {
        *self.last_used.lock().await = Instant::now();
    }
}

type DriverFactory = Box<dyn Fn(Engine) -> Arc<dyn BrowserDriver> + Send + Sync>;

pub struct BrowserLifecycleManager {
    instances: Mutex<HashMap<Engine, Arc<ManagedBrowser>>>,
    idle_timeout: Duration,
    metrics: Arc<dyn BrowserMetricsSink>,
    factory: DriverFactory,
    /// Engines whose driver was torn down by `recycle` and has not yet
    /// been recreated; consumed by the next `get_or_create` so only that
    /// recreation (not a fresh engine's first-ever creation) counts as a
    /// reinitialization.
    recovering: Mutex<HashSet<Engine>>,
}

impl BrowserLifecycleManager {
    pub fn new(idle_timeout: Duration, metrics: Arc<dyn BrowserMetricsSink>) -> Self {
        Self::with_factory(
            idle_timeout,
            metrics,
            |engine| Arc::new(BrowserDriverProcess::new(engine)) as Arc<dyn BrowserDriver>,
        )
    }

    /// As [`Self::new`], but with the driver factory overridable — tests
    /// inject a stub driver here instead of spawning node/playwright.
    pub fn with_factory(
        idle_timeout: Duration,
        metrics: Arc<dyn BrowserMetricsSink>,
        factory: impl Fn(Engine) -> Arc<dyn BrowserDriver> + Send + Sync + 'static,
    ) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            idle_timeout,
            metrics,
            factory: Box::new(factory),
            recovering: Mutex::new(HashSet::new()),
        }
    }

    /// Return the managed browser for `engine`, spawning its driver
    /// process on first use.
    pub async fn get_or_create(&self, engine: Engine) -> Arc<ManagedBrowser> {
        let mut guard = self.instances.lock().await;
        if let Some(existing) = guard.get(&engine) {
            existing.touch().await;
            return existing.clone();
        }
        let driver = (self.factory)(engine);
        let managed = Arc::new(ManagedBrowser {
            driver,
            last_used: Mutex::new(Instant::now()),
        });
        guard.insert(engine, managed.clone());
        if self.recovering.lock().await.remove(&engine) {
            self.metrics.on_reinitialization(engine);
        }
        self.metrics
            .set_instance_gauge(engine, guard.len() as u64);
        managed
    }

    /// Tear down and forget the driver for `engine` after it reported
    /// itself closed, so the next `get_or_create` respawns it. Single
    /// auto-recovery per attempt is enforced by the Fetch State Machine,
    /// which calls this at most once per navigation.
    pub async fn recycle(&self, engine: Engine) {
        let mut guard = self.instances.lock().await;
        if let Some(managed) = guard.remove(&engine) {
            managed.driver.kill().await;
        }
        self.recovering.lock().await.insert(engine);
        self.metrics
            .set_instance_gauge(engine, guard.len() as u64);
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn is_initialized(&self, engine: Engine) -> bool {
        self.instances.lock().await.contains_key(&engine)
    }

    /// The engines with a live driver right now — no static list, this
    /// reflects what has actually been created.
    pub async fn live_engines(&self) -> Vec<Engine> {
        let guard = self.instances.lock().await;
        let mut engines: Vec<Engine> = guard.keys().copied().collect();
        engines.sort_by_key(|e| e.as_str());
        engines
    }

    async fn reap_idle_once(&self) {
        let idle_timeout = self.idle_timeout;
        let mut to_remove = Vec::new();
        {
            let guard = self.instances.lock().await;
            for (engine, managed) in guard.iter() {
                let last_used = *managed.last_used.lock().await;
                if last_used.elapsed() > idle_timeout {
                    to_remove.push(*engine);
                }
            }
        }
        for engine in to_remove {
            tracing::info!(?engine, "reaping idle browser instance");
            self.recycle(engine).await;
        }
    }

    pub async fn shutdown_all(&self) {
        let mut guard = self.instances.lock().await;
        for (_, managed) in guard.drain() {
            managed.driver.kill().await;
        }
    }

    /// Record one browser operation's completion against the `operation`
    /// (`"html"` / `"screenshot"`) and `status` (`"success"` / `"error"` /
    /// `"timeout"` / `"proxy_page"`) labels.
    pub fn record_operation(&self, engine: Engine, operation: &str, status: &str) {
        self.metrics.on_operation(engine, operation);
        self.metrics.on_operation_status(engine, operation, status);
    }
}

/// One browser context + page pair for a single navigation attempt.
/// Guarantees `close_page`/`close_context` run on every exit path —
/// success, timeout, cancellation, or panic — matching the Browser
/// Lifecycle Manager's own release guarantee one level up.
///
/// `close` is the happy-path release and awaits the driver calls
/// in-line; `Drop` is the backstop for every other exit (an early
/// `return`, the future being dropped mid-`.await`, or unwinding) and
/// fires the same two calls as a detached task, since `Drop` cannot
/// itself `.await`.
pub struct BrowserSession {
    driver: Arc<dyn BrowserDriver>,
    context_id: String,
    page_id: String,
    closed: bool,
}

impl BrowserSession {
    pub fn new(driver: Arc<dyn BrowserDriver>, context_id: String, page_id: String) -> Self {
        Self {
            driver,
            context_id,
            page_id,
            closed: false,
        }
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub async fn close(mut self) {
        self.closed = true;
        self.driver.close_page(&self.page_id).await;
        self.driver.close_context(&self.context_id).await;
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let driver = self.driver.clone();
        let page_id = std::mem::take(&mut self.page_id);
        let context_id = std::mem::take(&mut self.context_id);
        tokio::spawn(async move {
            driver.close_page(&page_id).await;
            driver.close_context(&context_id).await;
        });
    }
}

/// Background task: periodically evict drivers idle past the
/// configured timeout.
pub fn spawn_idle_reaper(
    manager: Arc<BrowserLifecycleManager>,
    check_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;
            manager.reap_idle_once().await;
        }
    })
}

/// Map a raw driver error to whether the caller should recycle the
/// browser instance and retry once before surfacing the error further.
pub fn should_recycle(err: &DriverError) -> bool {
    match err {
        DriverError::Unavailable(msg) => is_stale_browser_error(msg),
        DriverError::Timeout(_) => false,
        DriverError::Protocol(_) => true,
    }
}
