//! Backend-agnostic data model for the fetchgate headless-fetch gateway.
//!
//! This crate has no IO. It defines the request/result shapes and the
//! small set of error kinds the rest of the workspace builds on, so that
//! `fetchgate-engine` and `fetchgate-server` can be swapped or tested in
//! isolation against the same contract.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One of the supported headless browser back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Chromium,
    Firefox,
    Webkit,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Chromium => "chromium",
            Engine::Firefox => "firefox",
            Engine::Webkit => "webkit",
        }
    }

    pub fn all() -> [Engine; 3] {
        [Engine::Chromium, Engine::Firefox, Engine::Webkit]
    }
}

impl std::str::FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chromium" | "chrome" => Ok(Engine::Chromium),
            "firefox" => Ok(Engine::Firefox),
            "webkit" => Ok(Engine::Webkit),
            other => Err(Error::InvalidRequest(format!(
                "unsupported browser_type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Navigation readiness condition passed through to the driver's `goto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    DomContentLoaded,
    NetworkIdle,
    Load,
    Commit,
}

impl Default for WaitUntil {
    fn default() -> Self {
        WaitUntil::DomContentLoaded
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 100_000;

/// Immutable input describing one fetch. Validated once at the API
/// boundary (`FetchRequest::validate`) so the core never sees a
/// malformed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub engine: EngineOrDefault,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub wait_until: WaitUntil,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub force_content_on_timeout: bool,
    /// §9(ii): request-level opt-out of the leaf-node proxy-page heuristic.
    #[serde(default)]
    pub skip_proxy_page_heuristic: bool,
    /// Screenshot-only fields; ignored by the HTML path.
    #[serde(default)]
    pub viewport_w: Option<u32>,
    #[serde(default)]
    pub viewport_h: Option<u32>,
    #[serde(default)]
    pub full_page: bool,
}

fn default_true() -> bool {
    true
}

/// Wire-compatible wrapper so a missing `engine` field defaults to
/// `chromium` without requiring callers to special-case it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineOrDefault(pub Engine);

impl Default for EngineOrDefault {
    fn default() -> Self {
        EngineOrDefault(Engine::Chromium)
    }
}

impl From<EngineOrDefault> for Engine {
    fn from(v: EngineOrDefault) -> Self {
        v.0
    }
}

impl FetchRequest {
    pub fn engine(&self) -> Engine {
        self.engine.0
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// §8 boundary behaviour: `timeout_ms` validated to [1000, 100000].
    pub fn validate(&self) -> Result<()> {
        if url::Url::parse(&self.url).is_err() {
            return Err(Error::InvalidUrl(self.url.clone()));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(Error::InvalidRequest(format!(
                "timeout_ms {} out of range [{MIN_TIMEOUT_MS}, {MAX_TIMEOUT_MS}]",
                self.timeout_ms
            )));
        }
        Ok(())
    }
}

/// Result of one fetch. Exactly one of `html` / `screenshot_b64` is
/// populated, selected by which endpoint was invoked — never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_b64: Option<String>,
    /// HTTP status from the page response, or a synthetic 6xx code (§6).
    pub page_status_code: i32,
    pub page_error: String,
    pub cache_hit: bool,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.page_status_code == 200
    }
}

/// Synthetic status codes used in `page_status_code` when no real HTTP
/// status is available (§6).
pub mod synthetic_status {
    pub const TIMEOUT_FORCED_CONTENT: i32 = 600;
    pub const TIMEOUT_NO_CONTENT: i32 = 601;
    pub const FETCH_FAILURE: i32 = 602;
    pub const OUTER_FAILURE: i32 = 603;
    pub const PROXY_EXCEPTION_EXHAUSTED: i32 = 604;
    pub const PROXY_PAGE_EXHAUSTED: i32 = 605;
}

/// Persisted row for one completed fetch attempt (successful or not).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Option<i64>,
    pub url: String,
    pub url_hash: String,
    pub engine: Engine,
    pub status_code: i32,
    pub response_time_s: f64,
    pub response_size: i64,
    pub response_headers_json: String,
    pub response_body: String,
    pub request_headers_json: String,
    pub request_body_json: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl HistoryRecord {
    /// `(url, engine)` cache key per §4.2 — `sha256(url)` paired with the
    /// engine so chromium/firefox/webkit renders of the same URL never
    /// collide.
    pub fn url_hash_of(url: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// The single currently-active upstream proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
    None,
    Static,
    Dynamic,
}

impl std::str::FromStr for ProxyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ProxyType::None),
            "static" => Ok(ProxyType::Static),
            "dynamic" => Ok(ProxyType::Dynamic),
            other => Err(Error::InvalidRequest(format!(
                "unsupported proxy_type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanHtmlRequest {
    pub html: String,
    #[serde(default = "default_parser")]
    pub parser: String,
}

fn default_parser() -> String {
    "html.parser".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanHtmlResponse {
    pub html: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str, timeout_ms: u64) -> FetchRequest {
        FetchRequest {
            url: url.to_string(),
            engine: EngineOrDefault::default(),
            timeout_ms,
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

    #[test]
    fn validate_rejects_out_of_range_timeout() {
        assert!(req("https://example.com", 999).validate().is_err());
        assert!(req("https://example.com", 100_001).validate().is_err());
        assert!(req("https://example.com", 10_000).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_url() {
        assert!(req("not a url", 10_000).validate().is_err());
    }

    #[test]
    fn engine_defaults_to_chromium() {
        assert_eq!(req("https://example.com", 10_000).engine(), Engine::Chromium);
    }

    #[test]
    fn engine_parses_known_names() {
        assert_eq!("firefox".parse::<Engine>().unwrap(), Engine::Firefox);
        assert_eq!("chrome".parse::<Engine>().unwrap(), Engine::Chromium);
        assert!("ie6".parse::<Engine>().is_err());
    }

    #[test]
    fn url_hash_is_stable_64_char_hex() {
        let h1 = HistoryRecord::url_hash_of("https://example.com");
        let h2 = HistoryRecord::url_hash_of("https://example.com");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn url_hash_differs_for_different_urls() {
        let a = HistoryRecord::url_hash_of("https://example.com/a");
        let b = HistoryRecord::url_hash_of("https://example.com/b");
        assert_ne!(a, b);
    }
}
