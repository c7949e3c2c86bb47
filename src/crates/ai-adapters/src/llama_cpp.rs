//! llama.cpp example server and llama-cpp-python adapters.
//!
//! Both truncate at stop strings on their own and stream over SSE.

use crate::adapter::{BackendAdapter, EventSender, GenerationCancelled};
use crate::http::{ensure_success, join_url};
use crate::params::{llama_cpp_payload, llama_cpp_python_payload};
use crate::stream_handler::{handle_completions_stream, handle_llama_cpp_stream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::Value;
use tavern_proxy_core_types::{BackendKind, GenerationParams};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionResponse {
    choices: Vec<OpenAiCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

async fn post_json(
    client: &reqwest::Client,
    url: String,
    payload: &Value,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    let request = client.post(url).json(payload).send();
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(GenerationCancelled.into()),
        response = request => response?,
    };
    ensure_success(response).await
}

pub struct LlamaCppAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl LlamaCppAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BackendAdapter for LlamaCppAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::LlamaCpp
    }

    async fn model_name(&self) -> Result<String> {
        let response = self.client.get(join_url(&self.base_url, "/")).send().await?;
        ensure_success(response).await?;
        Ok("llama.cpp".to_string())
    }

    async fn generate_blocking(
        &self,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String> {
        let url = join_url(&self.base_url, "/completion");
        let response = post_json(&self.client, url, &llama_cpp_payload(params, false), &cancel).await?;
        let body: CompletionResponse = response.json().await?;
        Ok(body.content)
    }

    async fn generate_streaming(
        &self,
        params: &GenerationParams,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let url = join_url(&self.base_url, "/completion");
        debug!("llama.cpp stream request: {}", url);
        let response = post_json(&self.client, url, &llama_cpp_payload(params, true), &cancel).await?;
        handle_llama_cpp_stream(response, tx, cancel).await;
        Ok(())
    }
}

pub struct LlamaCppPythonAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl LlamaCppPythonAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BackendAdapter for LlamaCppPythonAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::LlamaCppPython
    }

    async fn model_name(&self) -> Result<String> {
        let response = self
            .client
            .get(join_url(&self.base_url, "/v1/models"))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: ModelsResponse = response.json().await?;
        body.data
            .into_iter()
            .next()
            .map(|model| model.id)
            .ok_or_else(|| anyhow!("llama-cpp-python reported no models"))
    }

    async fn generate_blocking(
        &self,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String> {
        let url = join_url(&self.base_url, "/v1/completions");
        let payload = llama_cpp_python_payload(params, false);
        let response = post_json(&self.client, url, &payload, &cancel).await?;
        let body: OpenAiCompletionResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.text)
            .ok_or_else(|| anyhow!("llama-cpp-python response contained no choices"))
    }

    async fn generate_streaming(
        &self,
        params: &GenerationParams,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let url = join_url(&self.base_url, "/v1/completions");
        debug!("llama-cpp-python stream request: {}", url);
        let payload = llama_cpp_python_payload(params, true);
        let response = post_json(&self.client, url, &payload, &cancel).await?;
        handle_completions_stream(response, tx, cancel).await;
        Ok(())
    }
}
