//! The headless-browser driver: a long-lived Node.js + Playwright
//! subprocess spoken to over a line-delimited JSON protocol on
//! stdin/stdout.
//!
//! This module owns only the process lifecycle and wire protocol. It
//! does not classify proxy errors or drive retries — that is the Fetch
//! State Machine's job, one layer up, which runs the §4.3 pattern
//! matching against the `message` field this module surfaces.
//!
//! Grounded on `render_playwright.rs`'s approach of embedding a JS
//! script run via `node -e`, piping stdin/stdout/stderr, and bounding
//! the whole operation with `tokio::time::timeout` around `child.wait()`
//! — generalized here from one-shot-script-per-navigation to a
//! persistent RPC process so a `BrowserInstance` can actually be reused
//! across requests per §4.4.

use fetchgate_core::{Engine, WaitUntil};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

/// The driver surface the Fetch State Machine actually calls. Pulled out
/// as a trait so tests can swap [`BrowserDriverProcess`] for a stub that
/// never spawns node/playwright.
#[async_trait::async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn new_context(&self, proxy: Option<&str>) -> Result<String, DriverError>;
    async fn new_page(&self, context_id: &str) -> Result<String, DriverError>;
    async fn set_extra_headers(
        &self,
        page_id: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), DriverError>;
    async fn goto(
        &self,
        page_id: &str,
        url: &str,
        timeout_ms: u64,
        wait_until: WaitUntil,
        viewport: Option<(u32, u32)>,
    ) -> Result<NavigateOutcome, DriverError>;
    async fn content(&self, page_id: &str) -> Result<String, DriverError>;
    async fn screenshot_base64(&self, page_id: &str, full_page: bool) -> Result<String, DriverError>;
    async fn close_page(&self, page_id: &str);
    async fn close_context(&self, context_id: &str);
    async fn kill(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver process unavailable: {0}")]
    Unavailable(String),
    #[error("driver protocol error: {0}")]
    Protocol(String),
    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Serialize)]
struct Call<'a> {
    id: u64,
    cmd: &'a str,
    #[serde(flatten)]
    args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    /// `"timeout"` | `"closed"` | `"error"`
    kind: String,
    message: String,
}

/// Outcome of a single `goto` call, already split into the three shapes
/// the Fetch State Machine needs to dispatch on (§9 design note:
/// discriminated result instead of exceptions for control flow).
pub enum NavigateOutcome {
    Ok { status: u16 },
    Timeout,
    /// Driver-side error; `message` is pattern-matched by the caller
    /// against §4.3's proxy-error patterns.
    Error { message: String },
}

/// A persistent Node.js + Playwright process for one engine. Contexts
/// and pages are created/closed per request against this one process.
pub struct BrowserDriverProcess {
    engine: Engine,
    node_bin: String,
    hard_call_timeout: Duration,
    inner: Mutex<Option<Inner>>,
}

struct Inner {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    next_id: u64,
}

impl BrowserDriverProcess {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            node_bin: std::env::var("FETCHGATE_NODE").unwrap_or_else(|_| "node".to_string()),
            hard_call_timeout: Duration::from_secs(120),
            inner: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Lazily spawn the driver process if it is not already running.
    pub async fn ensure_started(&self) -> Result<(), DriverError> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let mut cmd = Command::new(&self.node_bin);
        cmd.arg("-e")
            .arg(driver_js())
            .arg("--")
            .arg(self.engine.as_str())
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| {
            DriverError::Unavailable(format!(
                "failed to start headless driver (node + playwright required): {e}"
            ))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            DriverError::Unavailable("driver process missing stdin pipe".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DriverError::Unavailable("driver process missing stdout pipe".to_string())
        })?;
        *guard = Some(Inner {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
        });
        Ok(())
    }

    /// Kill the process unconditionally. Idempotent.
    pub async fn kill(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut inner) = guard.take() {
            let _ = inner.child.kill().await;
        }
    }

    async fn call(&self, cmd: &str, args: serde_json::Value) -> Result<serde_json::Value, DriverError> {
        let fut = self.call_inner(cmd, args);
        match tokio::time::timeout(self.hard_call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => {
                self.kill().await;
                Err(DriverError::Timeout(self.hard_call_timeout))
            }
        }
    }

    async fn call_inner(
        &self,
        cmd: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DriverError> {
        self.ensure_started().await?;
        let mut guard = self.inner.lock().await;
        let inner = guard
            .as_mut()
            .ok_or_else(|| DriverError::Unavailable("driver not started".to_string()))?;

        inner.next_id += 1;
        let id = inner.next_id;
        let call = Call { id, cmd, args };
        let mut line = serde_json::to_string(&call)
            .map_err(|e| DriverError::Protocol(format!("encode call: {e}")))?;
        line.push('\n');

        if inner.stdin.write_all(line.as_bytes()).await.is_err() {
            drop(guard);
            self.mark_dead().await;
            return Err(DriverError::Unavailable(
                "driver process closed its stdin (has been closed)".to_string(),
            ));
        }

        let mut resp_line = String::new();
        match inner.stdout.read_line(&mut resp_line).await {
            Ok(0) | Err(_) => {
                drop(guard);
                self.mark_dead().await;
                return Err(DriverError::Unavailable(
                    "the handler is closed: driver process closed its stdout".to_string(),
                ));
            }
            Ok(_) => {}
        }

        let reply: Reply = serde_json::from_str(resp_line.trim())
            .map_err(|e| DriverError::Protocol(format!("decode reply: {e}. line: {resp_line}")))?;
        if reply.id != id {
            return Err(DriverError::Protocol(format!(
                "reply id mismatch: expected {id}, got {}",
                reply.id
            )));
        }
        if !reply.ok {
            let err = reply.error.unwrap_or(ReplyError {
                kind: "error".to_string(),
                message: "unknown driver error".to_string(),
            });
            return Err(DriverError::Unavailable(err.message));
        }
        Ok(reply.result)
    }

    async fn mark_dead(&self) {
        let mut guard = self.inner.lock().await;
        *guard = None;
    }

    pub async fn new_context(&self, proxy: Option<&str>) -> Result<String, DriverError> {
        let args = serde_json::json!({ "proxy": proxy });
        let v = self.call("new_context", args).await?;
        v.get("context_id")
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .ok_or_else(|| DriverError::Protocol("missing context_id".to_string()))
    }

    pub async fn new_page(&self, context_id: &str) -> Result<String, DriverError> {
        let args = serde_json::json!({ "context_id": context_id });
        let v = self.call("new_page", args).await?;
        v.get("page_id")
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .ok_or_else(|| DriverError::Protocol("missing page_id".to_string()))
    }

    pub async fn set_extra_headers(
        &self,
        page_id: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), DriverError> {
        if headers.is_empty() {
            return Ok(());
        }
        let args = serde_json::json!({ "page_id": page_id, "headers": headers });
        self.call("set_headers", args).await?;
        Ok(())
    }

    pub async fn goto(
        &self,
        page_id: &str,
        url: &str,
        timeout_ms: u64,
        wait_until: WaitUntil,
        viewport: Option<(u32, u32)>,
    ) -> Result<NavigateOutcome, DriverError> {
        let wait_str = match wait_until {
            WaitUntil::DomContentLoaded => "domcontentloaded",
            WaitUntil::NetworkIdle => "networkidle",
            WaitUntil::Load => "load",
            WaitUntil::Commit => "commit",
        };
        let args = serde_json::json!({
            "page_id": page_id,
            "url": url,
            "timeout_ms": timeout_ms,
            "wait_until": wait_str,
            "viewport": viewport.map(|(w, h)| serde_json::json!({"w": w, "h": h})),
        });
        match self.call("goto", args).await {
            Ok(v) => {
                let status = v.get("status").and_then(|x| x.as_u64()).unwrap_or(0) as u16;
                if status == 407 {
                    return Ok(NavigateOutcome::Error {
                        message: "Proxy connection refused: HTTP 407 auth_required".to_string(),
                    });
                }
                Ok(NavigateOutcome::Ok { status })
            }
            Err(DriverError::Timeout(_)) => Ok(NavigateOutcome::Timeout),
            Err(DriverError::Unavailable(msg)) if msg.contains("timeout") => {
                Ok(NavigateOutcome::Timeout)
            }
            Err(DriverError::Unavailable(msg)) => Ok(NavigateOutcome::Error { message: msg }),
            Err(e @ DriverError::Protocol(_)) => Err(e),
        }
    }

    pub async fn wait_dcl_best_effort(&self, page_id: &str, timeout_ms: u64) {
        let args = serde_json::json!({ "page_id": page_id, "timeout_ms": timeout_ms });
        let _ = self.call("wait_dcl", args).await;
    }

    pub async fn content(&self, page_id: &str) -> Result<String, DriverError> {
        let args = serde_json::json!({ "page_id": page_id });
        let v = self.call("content", args).await?;
        Ok(v.get("html").and_then(|x| x.as_str()).unwrap_or("").to_string())
    }

    pub async fn screenshot_base64(
        &self,
        page_id: &str,
        full_page: bool,
    ) -> Result<String, DriverError> {
        let args = serde_json::json!({ "page_id": page_id, "full_page": full_page });
        let v = self.call("screenshot", args).await?;
        Ok(v.get("b64").and_then(|x| x.as_str()).unwrap_or("").to_string())
    }

    pub async fn close_page(&self, page_id: &str) {
        let args = serde_json::json!({ "page_id": page_id });
        let _ = self.call("close_page", args).await;
    }

    pub async fn close_context(&self, context_id: &str) {
        let args = serde_json::json!({ "context_id": context_id });
        let _ = self.call("close_context", args).await;
    }
}

#[async_trait::async_trait]
impl BrowserDriver for BrowserDriverProcess {
    async fn new_context(&self, proxy: Option<&str>) -> Result<String, DriverError> {
        BrowserDriverProcess::new_context(self, proxy).await
    }

    async fn new_page(&self, context_id: &str) -> Result<String, DriverError> {
        BrowserDriverProcess::new_page(self, context_id).await
    }

    async fn set_extra_headers(
        &self,
        page_id: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), DriverError> {
        BrowserDriverProcess::set_extra_headers(self, page_id, headers).await
    }

    async fn goto(
        &self,
        page_id: &str,
        url: &str,
        timeout_ms: u64,
        wait_until: WaitUntil,
        viewport: Option<(u32, u32)>,
    ) -> Result<NavigateOutcome, DriverError> {
        BrowserDriverProcess::goto(self, page_id, url, timeout_ms, wait_until, viewport).await
    }

    async fn content(&self, page_id: &str) -> Result<String, DriverError> {
        BrowserDriverProcess::content(self, page_id).await
    }

    async fn screenshot_base64(&self, page_id: &str, full_page: bool) -> Result<String, DriverError> {
        BrowserDriverProcess::screenshot_base64(self, page_id, full_page).await
    }

    async fn close_page(&self, page_id: &str) {
        BrowserDriverProcess::close_page(self, page_id).await
    }

    async fn close_context(&self, context_id: &str) {
        BrowserDriverProcess::close_context(self, context_id).await
    }

    async fn kill(&self) {
        BrowserDriverProcess::kill(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_messages_name_their_kind() {
        assert_eq!(
            DriverError::Unavailable("closed".to_string()).to_string(),
            "driver process unavailable: closed"
        );
        assert_eq!(
            DriverError::Protocol("bad json".to_string()).to_string(),
            "driver protocol error: bad json"
        );
        assert_eq!(
            DriverError::Timeout(Duration::from_secs(5)).to_string(),
            "driver call timed out after 5s"
        );
    }

    #[tokio::test]
    async fn a_fresh_process_reports_not_running() {
        let driver = BrowserDriverProcess::new(Engine::Chromium);
        assert_eq!(driver.engine(), Engine::Chromium);
        assert!(!driver.is_running().await);
    }
}

/// §4.4 default WAF-evasion posture + the persistent JSON-RPC loop over
/// stdin/stdout. Kept as a single literal script, mirroring
/// `render_playwright.rs`'s embedded-JS style.
fn driver_js() -> &'static str {
    r#"
const readline = require('readline');
const engineName = process.argv[2] || 'chromium';

function reply(id, result) { process.stdout.write(JSON.stringify({ id, ok: true, result }) + '\n'); }
function replyErr(id, kind, message) { process.stdout.write(JSON.stringify({ id, ok: false, error: { kind, message } }) + '\n'); }

const BLOCKED_RESOURCE_GLOB = '**/*.{png,jpg,jpeg,gif,svg,mp3,mp4,avi,flac,ogg,wav,webm}';

const INIT_SCRIPT = `
  Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
  Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
  Object.defineProperty(navigator, 'languages', { get: () => ['zh-CN', 'zh', 'en'] });
  Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 8 });
  Object.defineProperty(navigator, 'deviceMemory', { get: () => 8 });
  const originalQuery = window.navigator.permissions.query;
  window.navigator.permissions.query = (parameters) => (
    parameters.name === 'notifications' ?
      Promise.resolve({ state: Notification.permission }) :
      originalQuery(parameters)
  );
`;

let pw;
let browser;
const contexts = new Map();
const pages = new Map();
let contextSeq = 0;
let pageSeq = 0;

async function ensureBrowser() {
  if (browser) return;
  pw = await require('playwright')[engineName].launch({ headless: true }).then(
    (b) => b,
    async () => {
      const api = await require('playwright');
      return api[engineName].launch({ headless: true });
    }
  );
  browser = pw;
}

async function handle(msg) {
  const { id, cmd } = msg;
  try {
    if (cmd === 'new_context') {
      await ensureBrowser();
      const opts = {
        ignoreHTTPSErrors: true,
        locale: 'zh-CN',
        timezoneId: 'Asia/Shanghai',
        viewport: { width: 1920, height: 1080 },
        geolocation: { latitude: 39.9, longitude: 116.4 },
        permissions: ['geolocation'],
        extraHTTPHeaders: {
          'Accept': 'text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8',
          'Accept-Language': 'zh-CN,zh;q=0.9,en;q=0.8',
          'Accept-Encoding': 'gzip, deflate, br',
          'Sec-Fetch-Dest': 'document',
          'Sec-Fetch-Mode': 'navigate',
          'Sec-Fetch-Site': 'none',
        },
      };
      if (msg.proxy) opts.proxy = { server: msg.proxy };
      const context = await browser.newContext(opts);
      await context.addInitScript(INIT_SCRIPT);
      await context.route(BLOCKED_RESOURCE_GLOB, (route) => route.abort());
      contextSeq += 1;
      const contextId = 'ctx' + contextSeq;
      contexts.set(contextId, context);
      return reply(id, { context_id: contextId });
    }
    if (cmd === 'new_page') {
      const context = contexts.get(msg.context_id);
      if (!context) return replyErr(id, 'error', 'unknown context_id');
      const page = await context.newPage();
      pageSeq += 1;
      const pageId = 'pg' + pageSeq;
      pages.set(pageId, page);
      return reply(id, { page_id: pageId });
    }
    if (cmd === 'set_headers') {
      const page = pages.get(msg.page_id);
      if (!page) return replyErr(id, 'error', 'unknown page_id');
      await page.setExtraHTTPHeaders(msg.headers || {});
      return reply(id, {});
    }
    if (cmd === 'goto') {
      const page = pages.get(msg.page_id);
      if (!page) return replyErr(id, 'error', 'unknown page_id');
      if (msg.viewport) await page.setViewportSize({ width: msg.viewport.w, height: msg.viewport.h });
      try {
        const resp = await page.goto(msg.url, { timeout: msg.timeout_ms, waitUntil: msg.wait_until });
        return reply(id, { status: resp ? resp.status() : 0 });
      } catch (e) {
        const name = e && e.name ? e.name : '';
        const message = String(e && e.message ? e.message : e);
        if (name === 'TimeoutError' || message.includes('Timeout')) {
          return replyErr(id, 'timeout', message);
        }
        return replyErr(id, 'error', message);
      }
    }
    if (cmd === 'wait_dcl') {
      const page = pages.get(msg.page_id);
      if (!page) return replyErr(id, 'error', 'unknown page_id');
      try { await page.waitForLoadState('domcontentloaded', { timeout: msg.timeout_ms }); } catch (_) {}
      return reply(id, {});
    }
    if (cmd === 'content') {
      const page = pages.get(msg.page_id);
      if (!page) return replyErr(id, 'error', 'unknown page_id');
      const html = await page.content();
      return reply(id, { html });
    }
    if (cmd === 'screenshot') {
      const page = pages.get(msg.page_id);
      if (!page) return replyErr(id, 'error', 'unknown page_id');
      const buf = await page.screenshot({ fullPage: !!msg.full_page, type: 'png' });
      return reply(id, { b64: buf.toString('base64') });
    }
    if (cmd === 'close_page') {
      const page = pages.get(msg.page_id);
      if (page) { await page.close().catch(() => {}); pages.delete(msg.page_id); }
      return reply(id, {});
    }
    if (cmd === 'close_context') {
      const context = contexts.get(msg.context_id);
      if (context) { await context.close().catch(() => {}); contexts.delete(msg.context_id); }
      return reply(id, {});
    }
    return replyErr(id, 'error', 'unknown command: ' + cmd);
  } catch (e) {
    return replyErr(id, 'error', String(e && e.message ? e.message : e));
  }
}

const rl = readline.createInterface({ input: process.stdin });
rl.on('line', (line) => {
  if (!line.trim()) return;
  let msg;
  try { msg = JSON.parse(line); } catch (e) { return; }
  handle(msg);
});
process.on('SIGTERM', async () => { try { if (browser) await browser.close(); } catch (_) {} process.exit(0); });
"#
}
