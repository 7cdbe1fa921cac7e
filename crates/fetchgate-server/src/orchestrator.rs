//! Request Orchestrator (C6): the sole owner of the admission semaphore.
//! Validates the request, probes the response cache, drives the Fetch
//! State Machine, and persists the outcome to history.
//!
//! Grounded on `config.py`'s `max_concurrent_requests` (default 10,
//! enforced in the original via a process-wide `asyncio.Semaphore`) and
//! `request_history_model.py`'s write-after-fetch / freshness-window
//! read pattern.

use chrono::Utc;
use fetchgate_core::{Error, FetchRequest, FetchResult, HistoryRecord, Result};
use fetchgate_engine::history::HistoryStore;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::metrics;
use crate::state_machine::{self, FetchDeps};

pub struct Orchestrator {
    semaphore: Arc<Semaphore>,
    deps: FetchDeps,
    history: Arc<dyn HistoryStore>,
    waiting: AtomicI64,
    processing: AtomicI64,
}

/// RAII guard around an admission counter: increments on construction,
/// decrements on drop. Dropping the future that holds this guard (a
/// cancelled request) still runs `Drop`, so `waiting_requests` /
/// `processing_requests` never leak upward the way a plain
/// `fetch_add`/`fetch_sub` pair around an `.await` would.
struct CounterGuard<'a> {
    counter: &'a AtomicI64,
    gauge: fn(i64),
}

impl<'a> CounterGuard<'a> {
    fn enter(counter: &'a AtomicI64, gauge: fn(i64)) -> Self {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        gauge(n);
        Self { counter, gauge }
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        let n = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        (self.gauge)(n);
    }
}

impl Orchestrator {
    pub fn new(max_concurrent: usize, deps: FetchDeps, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            deps,
            history,
            waiting: AtomicI64::new(0),
            processing: AtomicI64::new(0),
        }
    }

    pub async fn fetch_html(&self, req: &FetchRequest) -> Result<FetchResult> {
        self.run(req, false).await
    }

    pub async fn fetch_screenshot(&self, req: &FetchRequest) -> Result<FetchResult> {
        self.run(req, true).await
    }

    async fn run(&self, req: &FetchRequest, want_screenshot: bool) -> Result<FetchResult> {
        req.validate()?;

        if !want_screenshot && req.use_cache {
            let url_hash = HistoryRecord::url_hash_of(&req.url);
            match self.history.find_fresh(&url_hash, req.engine()).await {
                Ok(Some(record)) => {
                    metrics::record_cache_operation("hit");
                    return Ok(FetchResult {
                        html: Some(record.response_body),
                        screenshot_b64: None,
                        page_status_code: record.status_code,
                        page_error: String::new(),
                        cache_hit: true,
                    });
                }
                Ok(None) => metrics::record_cache_operation("miss"),
                Err(e) => {
                    tracing::warn!(error = %e, "cache lookup failed; proceeding without cache");
                    metrics::record_cache_operation("error");
                }
            }
        }

        let waiting_guard = CounterGuard::enter(&self.waiting, metrics::set_waiting_requests);
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Fetch(format!("admission semaphore closed: {e}")))?;
        drop(waiting_guard);

        let processing_guard =
            CounterGuard::enter(&self.processing, metrics::set_processing_requests);
        let start = Instant::now();
        let result = state_machine::run_fetch(&self.deps, req, want_screenshot).await;
        let elapsed = start.elapsed().as_secs_f64();
        drop(processing_guard);
        drop(permit);

        if !want_screenshot {
            // Every completed fetch gets a history row, success or not — it
            // is the audit trail. Cache-write *eligibility* is narrower and
            // enforced at read time by `find_fresh`'s `status_code = 200`
            // filter, not here.
            let now = Utc::now();
            let record = HistoryRecord {
                id: None,
                url: req.url.clone(),
                url_hash: HistoryRecord::url_hash_of(&req.url),
                engine: req.engine(),
                status_code: result.page_status_code,
                response_time_s: elapsed,
                response_size: result.html.as_ref().map(|h| h.len() as i64).unwrap_or(0),
                response_headers_json: "{}".to_string(),
                response_body: result.html.clone().unwrap_or_default(),
                request_headers_json: serde_json::to_string(&req.extra_headers)
                    .unwrap_or_else(|_| "{}".to_string()),
                request_body_json: "{}".to_string(),
                created_at: now,
                updated_at: now,
            };
            if let Err(e) = self.history.insert(&record).await {
                tracing::warn!(error = %e, "failed to persist history record");
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fetchgate_core::{Engine, EngineOrDefault, ProxyType, WaitUntil};
    use fetchgate_engine::driver::{BrowserDriver, DriverError, NavigateOutcome};
    use fetchgate_engine::proxy::{NoopProxyMetrics, ProxyPool, ProxySource, ProxySourceConfig};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn counter_guard_increments_then_decrements_on_drop() {
        let counter = AtomicI64::new(0);
        {
            let _guard = CounterGuard::enter(&counter, |_| {});
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    /// A cancelled future (dropped mid-`.await`, not run to completion)
    /// must still release the guard, or `waiting_requests`/
    /// `processing_requests` would drift upward forever under load.
    #[tokio::test]
    async fn counter_guard_decrements_even_when_its_future_is_dropped_early() {
        let counter = Arc::new(AtomicI64::new(0));
        let held = counter.clone();
        let never_finishes = async move {
            let _guard = CounterGuard::enter(&held, |_| {});
            std::future::pending::<()>().await;
        };
        tokio::select! {
            _ = never_finishes => unreachable!(),
            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    struct AlwaysFailsDriver;

    #[async_trait]
    impl BrowserDriver for AlwaysFailsDriver {
        async fn new_context(&self, _proxy: Option<&str>) -> std::result::Result<String, DriverError> {
            Ok("ctx".to_string())
        }
        async fn new_page(&self, _context_id: &str) -> std::result::Result<String, DriverError> {
            Ok("pg".to_string())
        }
        async fn set_extra_headers(
            &self,
            _page_id: &str,
            _headers: &BTreeMap<String, String>,
        ) -> std::result::Result<(), DriverError> {
            Ok(())
        }
        async fn goto(
            &self,
            _page_id: &str,
            _url: &str,
            _timeout_ms: u64,
            _wait_until: WaitUntil,
            _viewport: Option<(u32, u32)>,
        ) -> std::result::Result<NavigateOutcome, DriverError> {
            Ok(NavigateOutcome::Error {
                message: "DNS resolution failed for host".to_string(),
            })
        }
        async fn content(&self, _page_id: &str) -> std::result::Result<String, DriverError> {
            Ok(String::new())
        }
        async fn screenshot_base64(
            &self,
            _page_id: &str,
            _full_page: bool,
        ) -> std::result::Result<String, DriverError> {
            Ok(String::new())
        }
        async fn close_page(&self, _page_id: &str) {}
        async fn close_context(&self, _context_id: &str) {}
        async fn kill(&self) {}
    }

    struct RecordingHistory {
        inserts: tokio::sync::Mutex<Vec<HistoryRecord>>,
    }

    #[async_trait]
    impl HistoryStore for RecordingHistory {
        async fn find_fresh(&self, _url_hash: &str, _engine: Engine) -> Result<Option<HistoryRecord>> {
            Ok(None)
        }
        async fn insert(&self, record: &HistoryRecord) -> Result<i64> {
            self.inserts.lock().await.push(record.clone());
            Ok(1)
        }
    }

    fn sample_request(url: &str) -> FetchRequest {
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

    /// Every completed fetch gets a history row, not just the successful
    /// ones — the audit trail would otherwise be silent about failures.
    #[tokio::test]
    async fn history_row_is_written_even_when_the_fetch_fails() {
        let browsers = Arc::new(crate::browser::BrowserLifecycleManager::with_factory(
            Duration::from_secs(60),
            Arc::new(crate::browser::NoopBrowserMetrics),
            |_engine| Arc::new(AlwaysFailsDriver) as Arc<dyn BrowserDriver>,
        ));
        let proxy_source = ProxySource::new(
            reqwest::Client::new(),
            ProxySourceConfig {
                proxy_type: ProxyType::None,
                proxy_api_url: None,
                proxy_check_url: None,
                static_proxy: None,
            },
        );
        let proxy_pool = Arc::new(ProxyPool::new(proxy_source, Box::new(NoopProxyMetrics)));
        let deps = FetchDeps {
            browsers,
            proxy_pool,
            proxy_type: ProxyType::None,
        };
        let history = Arc::new(RecordingHistory {
            inserts: tokio::sync::Mutex::new(Vec::new()),
        });
        let orch = Orchestrator::new(4, deps, history.clone());

        let result = orch
            .fetch_html(&sample_request("https://example.com/broken"))
            .await
            .unwrap();

        assert_eq!(result.page_status_code, fetchgate_core::synthetic_status::FETCH_FAILURE);
        assert_eq!(history.inserts.lock().await.len(), 1);
    }
}
