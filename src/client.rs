//! HTTP client construction and JSON API helpers
//!
//! All outbound requests carry a fixed, browser-like header set; aggregator
//! CDNs refuse obviously non-browser traffic. The client honors the
//! configured proxy (HTTP/HTTPS URL or a local SOCKS endpoint assumed to be
//! already running) and a bounded per-request timeout; exceeding it counts
//! as a transient failure, not a fatal error.

use crate::config::{Config, ProxyConfig};
use crate::domain::DomainConfig;
use crate::error::{Error, Result};
use crate::retry::with_retry;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, CONNECTION, REFERER, USER_AGENT};

/// Browser User-Agent sent on every request
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Build the fixed header set for a given aggregator domain
pub fn default_headers(domain: &DomainConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    // Referer is per-domain; from_str only fails on non-ASCII, which a
    // hostname from the fixed table never contains
    if let Ok(value) = HeaderValue::from_str(&domain.referer()) {
        headers.insert(REFERER, value);
    }
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

/// Build a reqwest client for the given domain and configuration
///
/// # Errors
///
/// Returns [`Error::Config`] when the proxy URL is malformed; all other
/// builder failures surface as [`Error::Network`].
pub fn build_client(config: &Config, domain: &DomainConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .default_headers(default_headers(domain))
        .timeout(config.request_timeout)
        .connect_timeout(std::time::Duration::from_secs(15));

    match &config.proxy {
        ProxyConfig::Disabled => {}
        ProxyConfig::Http { url } | ProxyConfig::Socks { url } => {
            let proxy = reqwest::Proxy::all(url).map_err(|e| Error::Config {
                message: format!("invalid proxy URL '{url}': {e}"),
                key: Some("proxy".to_string()),
            })?;
            builder = builder.proxy(proxy);
        }
    }

    Ok(builder.build()?)
}

/// GET a URL and deserialize the JSON body, retrying transient failures
///
/// Non-success statuses become [`Error::Http`] (retryable for 5xx/429);
/// undecodable bodies become [`Error::MalformedResponse`] and exhaust
/// immediately.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    config: &Config,
    url: &str,
    max_attempts: u32,
) -> Result<T> {
    with_retry(&config.retry, max_attempts, || async {
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::MalformedResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    })
    .await
}
