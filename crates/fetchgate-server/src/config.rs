//! Runtime configuration, read once at startup from `service_*`
//! environment variables.
//!
//! Grounded on `config.py`'s `ServiceConfig(BaseSettings)` with
//! `env_prefix="service_"` — the env var names are carried over
//! unchanged; `pydantic_settings` itself is replaced by a plain
//! `from_env` constructor in the style the teacher uses for its own
//! `Config` (e.g. `firecrawl.rs`'s env-var reads), since this is a
//! small, flat settings object rather than a nested schema.

use fetchgate_core::{Error, Result};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    None,
    Static,
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub proxy_type: ProxyType,
    pub proxy_api_url: Option<String>,
    pub proxy_check_url: Option<String>,
    pub static_proxy: Option<String>,
    pub database_url: String,
    pub max_concurrent_requests: usize,
    pub auth_bearer_token: Option<String>,
    pub bind_addr: String,
    pub browser_idle_timeout: Duration,
    /// External sanitizer to delegate `/service/clean_html` to; HTML
    /// sanitization itself is out of scope for this gateway.
    pub html_sanitizer_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let proxy_type = match env("service_proxy_type").as_deref() {
            None | Some("none") | Some("") => ProxyType::None,
            Some("static") => ProxyType::Static,
            Some("dynamic") => ProxyType::Dynamic,
            Some(other) => {
                return Err(Error::NotConfigured(format!(
                    "service_proxy_type: unsupported value {other:?}"
                )))
            }
        };
        let proxy_api_url = env("service_proxy_api_url");
        let proxy_check_url = env("service_proxy_check_url");
        let static_proxy = env("service_static_proxy");

        if proxy_type == ProxyType::Dynamic && proxy_api_url.is_none() {
            return Err(Error::NotConfigured(
                "service_proxy_api_url is required when service_proxy_type=dynamic".to_string(),
            ));
        }
        if proxy_type == ProxyType::Static && static_proxy.is_none() {
            return Err(Error::NotConfigured(
                "service_static_proxy is required when service_proxy_type=static".to_string(),
            ));
        }

        let database_url =
            env("service_database_url").unwrap_or_else(|| "sqlite://fetchgate.db".to_string());

        let max_concurrent_requests = env("service_max_concurrent_requests")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(10);

        let auth_bearer_token = env("service_mcp_bearer_token").filter(|t| !t.is_empty());

        let bind_addr = env("fetchgate_bind_addr").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let browser_idle_timeout = Duration::from_secs(
            env("fetchgate_browser_idle_timeout_s")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(300),
        );

        let html_sanitizer_url = env("service_html_sanitizer_url");

        Ok(Self {
            proxy_type,
            proxy_api_url,
            proxy_check_url,
            static_proxy,
            database_url,
            max_concurrent_requests,
            auth_bearer_token,
            bind_addr,
            browser_idle_timeout,
            html_sanitizer_url,
        })
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        keys: Vec<&'static str>,
    }
    impl EnvGuard {
        fn set(pairs: &[(&'static str, &str)]) -> Self {
            let keys: Vec<&'static str> = pairs.iter().map(|(k, _)| *k).collect();
            for (k, v) in pairs {
                std::env::set_var(k, v);
            }
            Self { keys }
        }
    }
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for k in &self.keys {
                std::env::remove_var(k);
            }
        }
    }

    #[test]
    fn defaults_to_no_proxy_and_ten_concurrent() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(&[]);
        std::env::remove_var("service_proxy_type");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.proxy_type, ProxyType::None);
        assert_eq!(cfg.max_concurrent_requests, 10);
    }

    #[test]
    fn dynamic_proxy_without_api_url_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(&[("service_proxy_type", "dynamic")]);
        std::env::remove_var("service_proxy_api_url");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn dynamic_proxy_with_api_url_is_accepted() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(&[
            ("service_proxy_type", "dynamic"),
            ("service_proxy_api_url", "https://proxies.example.com/list"),
        ]);
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.proxy_type, ProxyType::Dynamic);
    }
}
