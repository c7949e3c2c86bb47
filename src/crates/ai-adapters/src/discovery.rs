//! Backend auto-discovery.
//!
//! Probes the configured local endpoints in a fixed order and returns the
//! first backend that answers like one.

use crate::adapter::BackendEndpoints;
use crate::http::join_url;
use anyhow::{anyhow, Result};
use log::{debug, info};
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tavern_proxy_core_types::BackendKind;

const KOBOLDCPP_FALLBACK_PORT: &str = "5001";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBackend {
    pub kind: BackendKind,
    pub version: Option<String>,
    /// Kobold API URL to use from now on; differs from the configured one
    /// when koboldcpp answered on its default port instead.
    pub kobold_api_url: String,
}

#[derive(Debug, Deserialize)]
struct ResultValue {
    #[serde(default)]
    result: Value,
}

/// `url` with its port swapped for koboldcpp's default.
fn with_koboldcpp_port(url: &str) -> Result<String> {
    let pattern = Regex::new(r"(.*):\d+$")?;
    Ok(pattern
        .replace(url, format!("${{1}}:{}", KOBOLDCPP_FALLBACK_PORT).as_str())
        .into_owned())
}

async fn probe_koboldcpp(client: &reqwest::Client, url: &str) -> Result<bool> {
    let response = client.get(join_url(url, "/api/extra/version")).send().await?;
    if !response.status().is_success() {
        return Ok(false);
    }
    let body: ResultValue = response.json().await?;
    Ok(body.result.as_str() == Some("KoboldCpp"))
}

/// Finds which backend is listening.
///
/// With Horde enabled nothing is probed. Every probe error is collected into
/// the final error when no backend answers.
pub async fn discover_backend(
    client: &reqwest::Client,
    endpoints: &BackendEndpoints,
    horde_enabled: bool,
) -> Result<DiscoveredBackend> {
    let found = |kind: BackendKind, version: Option<String>, kobold_api_url: &str| {
        info!("Detected backend: {} (version: {:?})", kind, version);
        DiscoveredBackend {
            kind,
            version,
            kobold_api_url: kobold_api_url.to_string(),
        }
    };

    if horde_enabled {
        return Ok(found(BackendKind::Horde, None, &endpoints.kobold_api_url));
    }

    let mut errors: Vec<String> = Vec::new();

    let configured = endpoints.kobold_api_url.as_str();
    let fallback = with_koboldcpp_port(configured)?;
    let mut candidates = vec![configured.to_string()];
    if fallback != configured {
        candidates.push(fallback);
    }
    for url in &candidates {
        debug!("Probing koboldcpp at {}", url);
        match probe_koboldcpp(client, url).await {
            Ok(true) => {
                if url != configured {
                    info!("Changed Kobold URL to {}", url);
                }
                return Ok(found(BackendKind::KoboldCpp, None, url));
            }
            Ok(false) => {}
            Err(e) => errors.push(e.to_string()),
        }
    }

    debug!("Probing Kobold/Ooba at {}", configured);
    match client
        .get(join_url(configured, "/api/v1/info/version"))
        .send()
        .await
    {
        Ok(response) if response.status() == StatusCode::OK => {
            let version = match response.json::<ResultValue>().await {
                Ok(body) => match body.result {
                    Value::String(version) => Some(version),
                    Value::Null => None,
                    other => Some(other.to_string()),
                },
                Err(e) => {
                    debug!("Kobold version response was not JSON: {}", e);
                    None
                }
            };
            return Ok(found(BackendKind::Kobold, version, configured));
        }
        Ok(response) if response.status() == StatusCode::NOT_FOUND => {
            return Ok(found(BackendKind::Ooba, None, configured));
        }
        Ok(_) => {}
        Err(e) => errors.push(e.to_string()),
    }

    debug!("Probing llama-cpp-python at {}", endpoints.llama_cpp_python_url);
    match client
        .get(join_url(&endpoints.llama_cpp_python_url, "/v1/models"))
        .send()
        .await
    {
        Ok(response) => {
            let uvicorn = response
                .headers()
                .get(reqwest::header::SERVER)
                .and_then(|value| value.to_str().ok())
                == Some("uvicorn");
            if response.status() == StatusCode::OK && uvicorn {
                return Ok(found(BackendKind::LlamaCppPython, None, configured));
            }
        }
        Err(e) => errors.push(e.to_string()),
    }

    debug!("Probing llama.cpp at {}", endpoints.llama_cpp_url);
    let llama_cpp = async {
        let response = client.get(join_url(&endpoints.llama_cpp_url, "/")).send().await?;
        Ok::<String, reqwest::Error>(response.text().await?)
    };
    match llama_cpp.await {
        Ok(body) if body.contains("llama.cpp") => {
            return Ok(found(BackendKind::LlamaCpp, None, configured));
        }
        Ok(_) => {}
        Err(e) => errors.push(e.to_string()),
    }

    Err(anyhow!(
        "Couldn't connect with a Kobold/KoboldCPP/Ooba backend.\n{}",
        errors.join("\n")
    ))
}
