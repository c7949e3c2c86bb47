//! Shared HTTP plumbing for the REST-speaking adapters.

use anyhow::{anyhow, Result};
use log::warn;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Response;
use std::time::Duration;

const CLIENT_USER_AGENT: &str = concat!("tavern-proxy/", env!("CARGO_PKG_VERSION"));

/// Builds the client every adapter shares.
///
/// No overall request timeout: generations legitimately take minutes.
pub fn build_http_client() -> reqwest::Client {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .use_rustls_tls()
        .default_headers(headers)
        .build()
        .unwrap_or_else(|e| {
            warn!("Failed to create HTTP client, using default config: {}", e);
            reqwest::Client::new()
        })
}

/// Turns a non-success status into an error carrying the backend's body text.
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        Err(anyhow!("backend returned HTTP {}", status))
    } else {
        Err(anyhow!("backend returned HTTP {}: {}", status, body))
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::join_url;

    #[test]
    fn join_url_drops_duplicate_slash() {
        assert_eq!(
            join_url("http://127.0.0.1:5000/", "/api/v1/generate"),
            "http://127.0.0.1:5000/api/v1/generate"
        );
        assert_eq!(join_url("http://host", "/x"), "http://host/x");
    }
}
