//! KoboldAI and koboldcpp adapter.
//!
//! Neither exposes token streaming on `/api/v1/generate`, so streaming is
//! emulated by repeated short generations whose output is appended to the
//! prompt ("pseudo-streaming"). KoboldAI can optionally stream through its
//! browser-UI socket instead, see [`crate::kobold_ui`].

use crate::adapter::{BackendAdapter, EventSender, GenerationCancelled};
use crate::http::{ensure_success, join_url};
use crate::kobold_ui;
use crate::params::kobold_payload;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, trace, warn};
use serde::Deserialize;
use serde_json::Value;
use tavern_proxy_core_types::{BackendKind, GenerationParams, StreamEvent};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PSEUDO_STREAM_CHUNK_TOKENS: u32 = 8;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    results: Vec<GenerateResult>,
}

#[derive(Debug, Deserialize)]
struct GenerateResult {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ResultValue {
    result: String,
}

pub struct KoboldAdapter {
    client: reqwest::Client,
    base_url: String,
    kind: BackendKind,
    chunk_tokens: u32,
    ui_streaming: bool,
}

impl KoboldAdapter {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            kind,
            chunk_tokens: DEFAULT_PSEUDO_STREAM_CHUNK_TOKENS,
            ui_streaming: false,
        }
    }

    /// Tokens requested per koboldcpp pseudo-stream round.
    pub fn with_chunk_tokens(mut self, chunk_tokens: u32) -> Self {
        self.chunk_tokens = chunk_tokens.max(1);
        self
    }

    /// Stream KoboldAI through its browser-UI socket instead of pseudo-streaming.
    pub fn with_ui_streaming(mut self, enabled: bool) -> Self {
        self.ui_streaming = enabled;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn generate_once(&self, payload: &Value) -> Result<String> {
        let response = self
            .client
            .post(join_url(&self.base_url, "/api/v1/generate"))
            .json(payload)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: GenerateResponse = response.json().await?;
        body.results
            .into_iter()
            .next()
            .map(|result| result.text)
            .ok_or_else(|| anyhow!("Kobold response contained no results"))
    }

    async fn abort_generation(&self) {
        if self.kind != BackendKind::KoboldCpp {
            return;
        }
        let url = join_url(&self.base_url, "/api/extra/abort");
        match self.client.post(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("koboldcpp generation aborted")
            }
            Ok(response) => warn!("koboldcpp abort returned HTTP {}", response.status()),
            Err(e) => warn!("koboldcpp abort failed: {}", e),
        }
    }

    async fn pseudo_stream(
        &self,
        params: &GenerationParams,
        tx: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunk_tokens = if self.kind == BackendKind::KoboldCpp {
            self.chunk_tokens.min(params.max_length.max(1))
        } else {
            params.max_length
        };
        let mut remaining = params.max_length as i64;
        let mut prompt = params.prompt.clone();
        let mut payload = kobold_payload(params, self.kind);
        payload["max_length"] = Value::from(chunk_tokens);

        debug!(
            "Kobold pseudo-stream started: kind={}, chunk_tokens={}, max_length={}",
            self.kind, chunk_tokens, params.max_length
        );

        while remaining > 0 && !cancel.is_cancelled() {
            payload["prompt"] = Value::String(prompt.clone());
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.abort_generation().await;
                    break;
                }
                result = self.generate_once(&payload) => result?,
            };
            trace!("Kobold chunk: {:?}", text);
            remaining -= chunk_tokens as i64;
            if text.is_empty() {
                break;
            }
            prompt.push_str(&text);
            if tx.send(Ok(StreamEvent::text(text))).is_err() {
                break;
            }
        }

        let _ = tx.send(Ok(StreamEvent::stop()));
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for KoboldAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn model_name(&self) -> Result<String> {
        let response = self
            .client
            .get(join_url(&self.base_url, "/api/v1/model"))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body: ResultValue = response.json().await?;
        Ok(body.result)
    }

    async fn generate_blocking(
        &self,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String> {
        let payload = kobold_payload(params, self.kind);
        debug!(
            "Kobold blocking generation: kind={}, max_length={}",
            self.kind, params.max_length
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.abort_generation().await;
                Err(GenerationCancelled.into())
            }
            result = self.generate_once(&payload) => result,
        }
    }

    async fn generate_streaming(
        &self,
        params: &GenerationParams,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.ui_streaming && self.kind == BackendKind::Kobold {
            return kobold_ui::stream_generation(&self.client, &self.base_url, params, &tx, &cancel)
                .await;
        }
        self.pseudo_stream(params, &tx, &cancel).await
    }
}
