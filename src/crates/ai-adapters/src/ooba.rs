//! text-generation-webui ("ooba") adapter.
//!
//! Blocking generations go through the Kobold-compatible REST API; streaming
//! uses the dedicated WebSocket endpoint, which pushes `text_stream` frames
//! and ends with `stream_end`.

use crate::adapter::{BackendAdapter, EventSender, GenerationCancelled};
use crate::http::{ensure_success, join_url};
use crate::params::ooba_payload;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, trace};
use serde::Deserialize;
use std::time::Duration;
use tavern_proxy_core_types::{BackendKind, GenerationParams, StreamEvent};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

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

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StreamFrame {
    TextStream {
        #[serde(default)]
        text: String,
    },
    StreamEnd,
}

fn parse_frame(raw: &str) -> Result<StreamEvent> {
    let frame: StreamFrame = serde_json::from_str(raw)
        .map_err(|e| anyhow!("Ooba stream parsing error: {}, data: {}", e, raw))?;
    Ok(match frame {
        StreamFrame::TextStream { text } => StreamEvent::text(text),
        StreamFrame::StreamEnd => StreamEvent::stop(),
    })
}

pub struct OobaAdapter {
    client: reqwest::Client,
    api_url: String,
    stream_url: String,
}

impl OobaAdapter {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        stream_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            stream_url: stream_url.into(),
        }
    }
}

#[async_trait]
impl BackendAdapter for OobaAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Ooba
    }

    async fn model_name(&self) -> Result<String> {
        let response = self
            .client
            .get(join_url(&self.api_url, "/api/v1/model"))
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
        let request = self
            .client
            .post(join_url(&self.api_url, "/api/v1/generate"))
            .json(&ooba_payload(params))
            .send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationCancelled.into()),
            response = request => response?,
        };
        let response = ensure_success(response).await?;
        let body: GenerateResponse = response.json().await?;
        body.results
            .into_iter()
            .next()
            .map(|result| result.text)
            .ok_or_else(|| anyhow!("Ooba response contained no results"))
    }

    async fn generate_streaming(
        &self,
        params: &GenerationParams,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (mut ws, _) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Ooba stream cancelled before connecting");
                return Ok(());
            }
            connected = connect_async(self.stream_url.as_str()) => connected?,
        };
        if cancel.is_cancelled() {
            let _ = ws.close(None).await;
            return Ok(());
        }
        ws.send(Message::Text(ooba_payload(params).to_string()))
            .await?;
        debug!("Ooba stream request sent to {}", self.stream_url);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Ooba stream cancelled, closing socket");
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                next = timeout(IDLE_TIMEOUT, ws.next()) => next,
            };
            let message = match next {
                Ok(Some(Ok(message))) => message,
                Ok(None) => {
                    let _ = tx.send(Ok(StreamEvent::stop()));
                    return Ok(());
                }
                Ok(Some(Err(e))) => {
                    let error_msg = format!("Ooba stream error: {}", e);
                    error!("{}", error_msg);
                    let _ = tx.send(Err(anyhow!(error_msg)));
                    return Ok(());
                }
                Err(_) => {
                    let error_msg =
                        format!("Ooba stream timeout after {}s", IDLE_TIMEOUT.as_secs());
                    error!("{}", error_msg);
                    let _ = tx.send(Err(anyhow!(error_msg)));
                    return Ok(());
                }
            };

            let raw = match message {
                Message::Text(raw) => raw,
                Message::Close(_) => {
                    let _ = tx.send(Ok(StreamEvent::stop()));
                    return Ok(());
                }
                _ => continue,
            };
            trace!("Ooba frame: {}", raw);

            match parse_frame(&raw) {
                Ok(event) => {
                    let stop = event.stop;
                    if tx.send(Ok(event)).is_err() || stop {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    let _ = tx.send(Err(e));
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_stream_frame() {
        let event = parse_frame(r#"{"event":"text_stream","message_num":0,"text":" Hi"}"#).unwrap();
        assert_eq!(event, StreamEvent::text(" Hi"));
    }

    #[test]
    fn stream_end_frame() {
        let event = parse_frame(r#"{"event":"stream_end","message_num":3}"#).unwrap();
        assert_eq!(event, StreamEvent::stop());
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(parse_frame(r#"{"event":"bogus"}"#).is_err());
    }
}
