//! Proxy Pool (C3): singleton cache of one active proxy, reuse counter,
//! failure-driven invalidation.
//!
//! Grounded directly on `base_proxy.py`: `PROXY_ERROR_PATTERNS`,
//! `PROXY_ERROR_PAGE_PATTERNS`, `is_proxy_error`, `is_proxy_error_page`,
//! `CachedProxy`, `ProxyManager`, and `ProxyPool`.

use fetchgate_core::ProxyType;
use html_scraper::{Html, Selector};
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// §4.3: exception-message substrings that imply a proxy transport
/// failure, in the order they are checked.
pub const PROXY_ERROR_PATTERNS: &[&str] = &[
    "net::ERR_TUNNEL_CONNECTION_FAILED",
    "NS_ERROR_PROXY_CONNECTION_REFUSED",
    "NS_ERROR_NET_EMPTY_RESPONSE",
    "ERR_PROXY_CONNECTION_FAILED",
    "Proxy connection refused",
    "Could not connect to proxy",
];

/// §4.3: content substrings that imply the proxy served an error page
/// instead of the target origin (HTTP 200, wrong body).
pub const PROXY_ERROR_PAGE_PATTERNS: &[&str] = &[
    "ErrorCode:631",
    "ErrorCode:632",
    "ErrorCode:633",
    "ErrorCode:634",
    "ErrorCode:635",
    "Proxy Error",
    "代理错误",
    "隧道连接失败",
];

const LEAF_NODE_MIN: usize = 32;

/// `is_proxy_error`: classify a driver-surfaced error message.
pub fn classify_proxy_error(message: &str) -> Option<&'static str> {
    for pattern in PROXY_ERROR_PATTERNS {
        if message.contains(pattern) {
            return Some(if pattern.contains("TUNNEL") {
                "tunnel_failed"
            } else if pattern.to_ascii_uppercase().contains("REFUSED") {
                "connection_refused"
            } else {
                "other"
            });
        }
    }
    if message.to_ascii_uppercase().contains("PROXY") {
        return Some("other");
    }
    None
}

/// `is_proxy_error_page`: classify page content as a proxy-served error
/// page. Returns the matched reason when triggered.
///
/// `skip_leaf_heuristic` implements SPEC_FULL.md §9(ii)'s request-level
/// opt-out of the leaf-node check; the content-pattern check always runs.
pub fn classify_proxy_error_page(html: &str, skip_leaf_heuristic: bool) -> Option<String> {
    if html.is_empty() {
        return None;
    }

    if !skip_leaf_heuristic {
        let leaves = count_leaf_nodes(html);
        if leaves < LEAF_NODE_MIN {
            return Some("leaf_nodes_too_few".to_string());
        }
    }

    for pattern in PROXY_ERROR_PAGE_PATTERNS {
        if html.contains(pattern) {
            return Some(pattern.to_string());
        }
    }
    None
}

/// Count leaf (childless) element nodes in the parsed DOM tree.
fn count_leaf_nodes(html: &str) -> usize {
    let doc = Html::parse_document(html);
    // scraper's tree is an ego_tree; select all elements and count those
    // with no element children.
    let all = Selector::parse("*").unwrap();
    doc.select(&all)
        .filter(|el| el.children().all(|c| c.value().as_element().is_none()))
        .count()
}

#[derive(Debug, Clone)]
pub struct CachedProxy {
    pub server: String,
    pub proxy_type: ProxyType,
    pub reuse_count: u64,
    pub acquired_at: Instant,
}

impl CachedProxy {
    fn increment_reuse(&mut self) -> u64 {
        self.reuse_count += 1;
        self.reuse_count
    }
}

/// Upper bound on the dynamic-proxy fetch loop (SPEC_FULL.md §9(iii)):
/// the original retries forever; this caps it so an outage cannot wedge
/// the caller indefinitely.
const PROXY_FETCH_MAX_ATTEMPTS: u32 = 30;
const PROXY_FETCH_BACKOFF: Duration = Duration::from_secs(2);

const PROXY_CHECK_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Safari/605.1.15",
];

#[derive(Debug, Clone)]
pub struct ProxySourceConfig {
    pub proxy_type: ProxyType,
    pub proxy_api_url: Option<String>,
    pub proxy_check_url: Option<String>,
    pub static_proxy: Option<String>,
}

/// Fetches a fresh proxy endpoint from the configured source. This is
/// the part of `ProxyManager` that talks to the outside world; `get`
/// below is the reuse/invalidate cache on top of it.
pub struct ProxySource {
    client: reqwest::Client,
    config: ProxySourceConfig,
}

impl ProxySource {
    pub fn new(client: reqwest::Client, config: ProxySourceConfig) -> Self {
        Self { client, config }
    }

    pub async fn fetch(&self) -> Option<String> {
        match self.config.proxy_type {
            ProxyType::None => None,
            ProxyType::Static => self.config.static_proxy.clone(),
            ProxyType::Dynamic => self.fetch_dynamic().await,
        }
    }

    async fn fetch_dynamic(&self) -> Option<String> {
        let url = self.config.proxy_api_url.as_deref()?;
        for attempt in 0..PROXY_FETCH_MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(PROXY_FETCH_BACKOFF).await;
            }
            let resp = match self
                .client
                .get(url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "proxy source request failed");
                    continue;
                }
            };
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 200 && !body.trim().is_empty() {
                let candidate = body.trim().to_string();
                if let Some(check_url) = &self.config.proxy_check_url {
                    if !self.check(&candidate, check_url).await {
                        continue;
                    }
                }
                return Some(candidate);
            }
            if status.as_u16() == 400 || status.as_u16() == 503 {
                tracing::warn!(%status, "proxy source returned skip status");
                continue;
            }
            if body.trim().is_empty() {
                tracing::warn!("proxy source returned empty body");
                continue;
            }
        }
        tracing::warn!(attempts = PROXY_FETCH_MAX_ATTEMPTS, "proxy source exhausted retry budget");
        None
    }

    async fn check(&self, proxy: &str, check_url: &str) -> bool {
        let Ok(proxy_cfg) = reqwest::Proxy::all(proxy) else {
            return false;
        };
        let Ok(client) = reqwest::Client::builder().proxy(proxy_cfg).build() else {
            return false;
        };
        let ua = PROXY_CHECK_USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(PROXY_CHECK_USER_AGENTS[0]);
        match client
            .head(check_url)
            .header("User-Agent", ua)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) => r.status().as_u16() == 200,
            Err(_) => false,
        }
    }
}

/// Metrics callback surface so `ProxyPool` stays decoupled from exactly
/// how instruments are installed (the server crate wires `metrics::`
/// macros behind this).
pub trait ProxyMetricsSink: Send + Sync {
    fn observe_reuse_count(&self, proxy_type: ProxyType, reuse_count: u64);
    fn set_current_reuse_count(&self, count: u64);
    fn record_switch(&self, reason: &str);
}

pub struct NoopProxyMetrics;
impl ProxyMetricsSink for NoopProxyMetrics {
    fn observe_reuse_count(&self, _: ProxyType, _: u64) {}
    fn set_current_reuse_count(&self, _: u64) {}
    fn record_switch(&self, _: &str) {}
}

struct ProxyPoolState {
    cached: Option<CachedProxy>,
}

/// Process-local singleton cache of one active proxy. Constructed by the
/// service entrypoint and shared via `Arc`, per SPEC_FULL.md §5 (no
/// process-global statics, so tests can build independent instances).
pub struct ProxyPool {
    source: ProxySource,
    metrics: Box<dyn ProxyMetricsSink>,
    state: Mutex<ProxyPoolState>,
}

impl ProxyPool {
    pub fn new(source: ProxySource, metrics: Box<dyn ProxyMetricsSink>) -> Self {
        Self {
            source,
            metrics,
            state: Mutex::new(ProxyPoolState { cached: None }),
        }
    }

    /// `get(force_refresh)`: reuse the cached proxy unless forced or
    /// absent; otherwise fetch a fresh one and reset `reuse_count` to 1.
    pub async fn get(&self, force_refresh: bool) -> Option<String> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.cached.as_mut() {
            if !force_refresh {
                let count = cached.increment_reuse();
                self.metrics.set_current_reuse_count(count);
                return Some(cached.server.clone());
            }
            self.record_reuse_stats(&state.cached);
        }

        let proxy_type = self.source.config.proxy_type;
        let proxy = self.source.fetch().await;
        match proxy {
            Some(server) => {
                state.cached = Some(CachedProxy {
                    server: server.clone(),
                    proxy_type,
                    reuse_count: 1,
                    acquired_at: Instant::now(),
                });
                self.metrics.set_current_reuse_count(1);
                Some(server)
            }
            None => {
                state.cached = None;
                self.metrics.set_current_reuse_count(0);
                None
            }
        }
    }

    /// `invalidate(reason)`: drop the cached proxy, emitting reuse-count
    /// and switch-reason telemetry.
    pub async fn invalidate(&self, reason: &str) {
        let mut state = self.state.lock().await;
        if state.cached.is_some() {
            self.record_reuse_stats(&state.cached);
            self.metrics.record_switch(reason);
            state.cached = None;
            self.metrics.set_current_reuse_count(0);
        }
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.cached.is_some() {
            self.record_reuse_stats(&state.cached);
            state.cached = None;
            self.metrics.set_current_reuse_count(0);
        }
    }

    pub async fn current_reuse_count(&self) -> u64 {
        self.state
            .lock()
            .await
            .cached
            .as_ref()
            .map(|c| c.reuse_count)
            .unwrap_or(0)
    }

    fn record_reuse_stats(&self, cached: &Option<CachedProxy>) {
        if let Some(c) = cached {
            if c.reuse_count > 0 {
                self.metrics.observe_reuse_count(c.proxy_type, c.reuse_count);
            }
        }
    }
}
