//! SSE stream handlers for the llama.cpp family.

use crate::adapter::EventSender;
use anyhow::{anyhow, Result};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use log::{debug, error, trace};
use reqwest::Response;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tavern_proxy_core_types::StreamEvent;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, PartialEq, Eq)]
enum SseItem {
    Event(StreamEvent),
    Skip,
    Done,
}

#[derive(Debug, Deserialize)]
struct LlamaCppChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunkChoice {
    #[serde(default)]
    text: String,
    finish_reason: Option<String>,
}

fn extract_sse_api_error_message(event_json: &Value) -> Option<String> {
    let error = event_json.get("error")?;
    if let Some(message) = error.get("message").and_then(|value| value.as_str()) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("An error occurred during streaming".to_string())
}

fn parse_json(raw: &str) -> Result<Value> {
    let event_json: Value = serde_json::from_str(raw)
        .map_err(|e| anyhow!("SSE parsing error: {}, data: {}", e, raw))?;
    if let Some(message) = extract_sse_api_error_message(&event_json) {
        return Err(anyhow!("SSE API error: {}, data: {}", message, raw));
    }
    Ok(event_json)
}

fn parse_llama_cpp_item(raw: &str) -> Result<SseItem> {
    if raw == "[DONE]" {
        return Ok(SseItem::Done);
    }
    let chunk: LlamaCppChunk = serde_json::from_value(parse_json(raw)?)
        .map_err(|e| anyhow!("SSE data schema error: {}, data: {}", e, raw))?;
    Ok(SseItem::Event(StreamEvent {
        text: chunk.content,
        stop: chunk.stop,
    }))
}

fn parse_completion_item(raw: &str) -> Result<SseItem> {
    if raw == "[DONE]" {
        return Ok(SseItem::Done);
    }
    let chunk: CompletionChunk = serde_json::from_value(parse_json(raw)?)
        .map_err(|e| anyhow!("SSE data schema error: {}, data: {}", e, raw))?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(SseItem::Skip);
    };
    Ok(SseItem::Event(StreamEvent {
        text: choice.text,
        stop: choice.finish_reason.is_some(),
    }))
}

/// Streams llama.cpp `/completion` frames (`{"content", "stop"}`).
pub async fn handle_llama_cpp_stream(response: Response, tx: EventSender, cancel: CancellationToken) {
    pump_sse(response, tx, cancel, "llama.cpp", parse_llama_cpp_item).await
}

/// Streams OpenAI-style `/v1/completions` chunks ending in `[DONE]`.
pub async fn handle_completions_stream(
    response: Response,
    tx: EventSender,
    cancel: CancellationToken,
) {
    pump_sse(response, tx, cancel, "completions", parse_completion_item).await
}

async fn pump_sse<F>(
    response: Response,
    tx: EventSender,
    cancel: CancellationToken,
    label: &str,
    parse: F,
) where
    F: Fn(&str) -> Result<SseItem>,
{
    let mut stream = response.bytes_stream().eventsource();

    loop {
        let sse_event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{} SSE stream cancelled, dropping connection", label);
                return;
            }
            next = timeout(IDLE_TIMEOUT, stream.next()) => next,
        };
        let sse = match sse_event {
            Ok(Some(Ok(sse))) => sse,
            Ok(None) => {
                debug!("{} SSE stream closed", label);
                let _ = tx.send(Ok(StreamEvent::stop()));
                return;
            }
            Ok(Some(Err(e))) => {
                let error_msg = format!("SSE stream error: {}", e);
                error!("{}", error_msg);
                let _ = tx.send(Err(anyhow!(error_msg)));
                return;
            }
            Err(_) => {
                let error_msg = format!("SSE stream timeout after {}s", IDLE_TIMEOUT.as_secs());
                error!("{}", error_msg);
                let _ = tx.send(Err(anyhow!(error_msg)));
                return;
            }
        };

        let raw = sse.data;
        trace!("{} SSE: {:?}", label, raw);

        match parse(&raw) {
            Ok(SseItem::Done) => {
                let _ = tx.send(Ok(StreamEvent::stop()));
                return;
            }
            Ok(SseItem::Skip) => continue,
            Ok(SseItem::Event(event)) => {
                let stop = event.stop;
                if tx.send(Ok(event)).is_err() || stop {
                    return;
                }
            }
            Err(e) => {
                error!("{}", e);
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama_cpp_frame_with_stop() {
        assert_eq!(
            parse_llama_cpp_item(r#"{"content":" world","stop":true}"#).unwrap(),
            SseItem::Event(StreamEvent {
                text: " world".to_string(),
                stop: true
            })
        );
    }

    #[test]
    fn completion_chunk_text_and_done() {
        assert_eq!(
            parse_completion_item(r#"{"choices":[{"text":"Hi","finish_reason":null}]}"#).unwrap(),
            SseItem::Event(StreamEvent::text("Hi"))
        );
        assert_eq!(parse_completion_item("[DONE]").unwrap(), SseItem::Done);
        assert_eq!(parse_completion_item(r#"{"choices":[]}"#).unwrap(), SseItem::Skip);
    }

    #[test]
    fn finish_reason_marks_stop() {
        let item =
            parse_completion_item(r#"{"choices":[{"text":"","finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(item, SseItem::Event(StreamEvent::stop()));
    }

    #[test]
    fn api_error_payload_is_an_error() {
        let err = parse_llama_cpp_item(r#"{"error":{"message":"context full"}}"#).unwrap_err();
        assert!(err.to_string().contains("context full"));
        let err = parse_completion_item(r#"{"error":"boom"}"#).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_llama_cpp_item("{not json").is_err());
    }
}
