//! Fetch State Machine (C5): drives one browser navigation through its
//! retry branches — success, timeout, proxy exception, proxy-served
//! error page, or a fatal error — bounded by a fixed retry budget.
//!
//! Grounded on `utils.py`'s fetch loop (force-content-on-timeout,
//! "HTTP 407 is a proxy failure, not a fatal one") generalized per
//! SPEC_FULL.md §4.5 into an explicit state machine, since the sampled
//! original (`service_router.py`) calls `ProxyManager` directly with no
//! bounded retry loop of its own — SPEC_FULL.md's richer machine is
//! authoritative here, not the on-disk original.
//!
//! Tie-break (§4.5): a navigation that completes with an HTTP response
//! is still checked against the proxy-error-page heuristic before being
//! accepted — proxy-page detection wins over a bare timeout classification
//! in the same attempt.

use fetchgate_core::{synthetic_status, Engine, FetchRequest, FetchResult};
use fetchgate_engine::driver::{DriverError, NavigateOutcome};
use fetchgate_engine::encoding::fix_garbled_html;
use fetchgate_engine::proxy::{classify_proxy_error, classify_proxy_error_page, ProxyPool};
use std::sync::Arc;
use std::time::Instant;

use crate::browser::{is_stale_browser_error, BrowserLifecycleManager, BrowserSession};
use crate::metrics;

/// Upper bound on proxy-driven retries within a single fetch (§4.5).
/// Distinct from the single browser-recovery allowance in
/// `browser::BrowserLifecycleManager`.
pub const MAX_PROXY_RETRY_ATTEMPTS: u32 = 3;

pub struct FetchDeps {
    pub browsers: Arc<BrowserLifecycleManager>,
    pub proxy_pool: Arc<ProxyPool>,
    pub proxy_type: fetchgate_core::ProxyType,
}

/// Run one fetch to completion, retrying proxy failures up to
/// [`MAX_PROXY_RETRY_ATTEMPTS`] times and recovering a stale browser
/// instance at most once.
pub async fn run_fetch(deps: &FetchDeps, req: &FetchRequest, want_screenshot: bool) -> FetchResult {
    let engine = req.engine();
    let mut proxy_attempt: u32 = 0;
    let mut browser_recovered = false;

    loop {
        let force_refresh = proxy_attempt > 0;
        let proxy = deps.proxy_pool.get(force_refresh).await;
        if proxy.is_some() {
            metrics::record_proxy_usage(deps.proxy_type);
        }

        let start = Instant::now();
        let attempt = navigate_once(deps, req, engine, proxy.as_deref(), want_screenshot).await;
        let elapsed = start.elapsed().as_secs_f64();
        metrics::record_browser_operation_duration(engine, "goto", elapsed);

        match attempt {
            Attempt::Success {
                html,
                screenshot_b64,
                status,
            } => {
                metrics::record_page_status_code(engine, status as i32);
                return FetchResult {
                    html,
                    screenshot_b64,
                    page_status_code: status as i32,
                    page_error: String::new(),
                    cache_hit: false,
                };
            }
            Attempt::ProxyPage { pattern } => {
                deps.proxy_pool.invalidate(&pattern).await;
                proxy_attempt += 1;
                metrics::record_proxy_retry(proxy_attempt);
                if proxy_attempt > MAX_PROXY_RETRY_ATTEMPTS {
                    return terminal(
                        synthetic_status::PROXY_PAGE_EXHAUSTED,
                        &proxy_exhausted_message(&pattern),
                    );
                }
                continue;
            }
            Attempt::Timeout { forced_html } => {
                if let Some(html) = forced_html.filter(|_| req.force_content_on_timeout) {
                    metrics::record_page_status_code(engine, synthetic_status::TIMEOUT_FORCED_CONTENT);
                    return FetchResult {
                        html: Some(html),
                        screenshot_b64: None,
                        page_status_code: synthetic_status::TIMEOUT_FORCED_CONTENT,
                        page_error: "navigation timed out; returning best-effort content".to_string(),
                        cache_hit: false,
                    };
                }
                metrics::record_page_status_code(engine, synthetic_status::TIMEOUT_NO_CONTENT);
                return terminal(synthetic_status::TIMEOUT_NO_CONTENT, "navigation timed out");
            }
            Attempt::ProxyException { reason } => {
                deps.proxy_pool.invalidate(&reason).await;
                proxy_attempt += 1;
                metrics::record_proxy_retry(proxy_attempt);
                if proxy_attempt > MAX_PROXY_RETRY_ATTEMPTS {
                    return terminal(
                        synthetic_status::PROXY_EXCEPTION_EXHAUSTED,
                        &proxy_exhausted_message(&reason),
                    );
                }
                continue;
            }
            Attempt::StaleBrowser { message } => {
                if browser_recovered {
                    return terminal(synthetic_status::OUTER_FAILURE, &message);
                }
                deps.browsers.recycle(engine).await;
                browser_recovered = true;
                continue;
            }
            Attempt::Fatal { message } => {
                metrics::record_api_error("fetch_fatal");
                return terminal(synthetic_status::FETCH_FAILURE, &message);
            }
        }
    }
}

fn terminal(status: i32, message: &str) -> FetchResult {
    FetchResult {
        html: None,
        screenshot_b64: None,
        page_status_code: status,
        page_error: message.to_string(),
        cache_hit: false,
    }
}

/// `page_error` text for the two "retried and gave up" terminal codes
/// (604, 605): always begins with "Proxy error after N retries" ahead
/// of the classification reason.
fn proxy_exhausted_message(reason: &str) -> String {
    format!("Proxy error after {MAX_PROXY_RETRY_ATTEMPTS} retries: {reason}")
}

enum Attempt {
    Success {
        html: Option<String>,
        screenshot_b64: Option<String>,
        status: u16,
    },
    Timeout { forced_html: Option<String> },
    ProxyException { reason: String },
    ProxyPage { pattern: String },
    StaleBrowser { message: String },
    Fatal { message: String },
}

async fn navigate_once(
    deps: &FetchDeps,
    req: &FetchRequest,
    engine: Engine,
    proxy: Option<&str>,
    want_screenshot: bool,
) -> Attempt {
    let managed = deps.browsers.get_or_create(engine).await;
    let driver = managed.driver.clone();
    let operation = if want_screenshot { "screenshot" } else { "html" };

    let context_id = match driver.new_context(proxy).await {
        Ok(id) => id,
        Err(e) => return classify_driver_error(e),
    };
    let page_id = match driver.new_page(&context_id).await {
        Ok(id) => id,
        Err(e) => {
            driver.close_context(&context_id).await;
            return classify_driver_error(e);
        }
    };
    // From here on, `session` guarantees the context+page are released on
    // every exit path below, including an early `return` and cancellation.
    let session = BrowserSession::new(driver.clone(), context_id, page_id.clone());

    if driver
        .set_extra_headers(&page_id, &req.extra_headers)
        .await
        .is_err()
    {
        // Header rejection never aborts the navigation; best-effort only.
    }

    let viewport = req.viewport_w.zip(req.viewport_h);
    let goto_result = driver
        .goto(&page_id, &req.url, req.timeout_ms, req.wait_until, viewport)
        .await;

    let outcome = match goto_result {
        Ok(o) => o,
        Err(e) => {
            deps.browsers.record_operation(engine, operation, "error");
            return classify_driver_error(e);
        }
    };

    let result = match outcome {
        NavigateOutcome::Timeout => {
            let forced_html = if req.force_content_on_timeout {
                driver
                    .content(&page_id)
                    .await
                    .ok()
                    .map(|html| fix_garbled_html(&html, None))
            } else {
                None
            };
            deps.browsers.record_operation(engine, operation, "timeout");
            Attempt::Timeout { forced_html }
        }
        NavigateOutcome::Error { message } => {
            deps.browsers.record_operation(engine, operation, "error");
            classify_navigation_error(&message)
        }
        NavigateOutcome::Ok { status } => {
            match driver.content(&page_id).await {
                Ok(raw_html) => {
                    // C1 Encoding Repair: `page.content()` is already a JS
                    // string, so there are no raw bytes here to re-decode —
                    // only the mojibake-ratio repair trick applies.
                    let html = fix_garbled_html(&raw_html, None);
                    if !req.skip_proxy_page_heuristic {
                        if let Some(pattern) = classify_proxy_error_page(&html, false) {
                            deps.browsers.record_operation(engine, operation, "proxy_page");
                            session.close().await;
                            return Attempt::ProxyPage { pattern };
                        }
                    }
                    if want_screenshot {
                        match driver.screenshot_base64(&page_id, req.full_page).await {
                            Ok(b64) => {
                                deps.browsers.record_operation(engine, operation, "success");
                                Attempt::Success {
                                    html: None,
                                    screenshot_b64: Some(b64),
                                    status,
                                }
                            }
                            Err(e) => {
                                deps.browsers.record_operation(engine, operation, "error");
                                classify_driver_error(e)
                            }
                        }
                    } else {
                        deps.browsers.record_operation(engine, operation, "success");
                        Attempt::Success {
                            html: Some(html),
                            screenshot_b64: None,
                            status,
                        }
                    }
                }
                Err(e) => {
                    deps.browsers.record_operation(engine, operation, "error");
                    classify_driver_error(e)
                }
            }
        }
    };

    session.close().await;
    result
}

fn classify_driver_error(err: DriverError) -> Attempt {
    match &err {
        DriverError::Timeout(_) => Attempt::Timeout { forced_html: None },
        DriverError::Unavailable(msg) => classify_navigation_error(msg),
        DriverError::Protocol(msg) => Attempt::Fatal {
            message: msg.clone(),
        },
    }
}

fn classify_navigation_error(message: &str) -> Attempt {
    if is_stale_browser_error(message) {
        return Attempt::StaleBrowser {
            message: message.to_string(),
        };
    }
    if let Some(reason) = classify_proxy_error(message) {
        metrics::record_proxy_failure();
        return Attempt::ProxyException {
            reason: format!("{reason}: {message}"),
        };
    }
    Attempt::Fatal {
        message: message.to_string(),
    }
}
