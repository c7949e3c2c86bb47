use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tavern_proxy_core_types::{BackendKind, GenerationParams, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel an adapter pushes generated text into while streaming.
pub type EventSender = mpsc::UnboundedSender<Result<StreamEvent>>;

/// Marker error returned when a generation stops because its token was cancelled.
#[derive(Debug, thiserror::Error)]
#[error("generation cancelled")]
pub struct GenerationCancelled;

/// Base URLs of the locally hosted backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpoints {
    pub kobold_api_url: String,
    pub ooba_stream_url: String,
    pub llama_cpp_url: String,
    pub llama_cpp_python_url: String,
}

impl Default for BackendEndpoints {
    fn default() -> Self {
        Self {
            kobold_api_url: "http://127.0.0.1:5000".to_string(),
            ooba_stream_url: "ws://127.0.0.1:5005/api/v1/stream".to_string(),
            llama_cpp_url: "http://127.0.0.1:8080".to_string(),
            llama_cpp_python_url: "http://127.0.0.1:8000".to_string(),
        }
    }
}

/// A text-generation backend.
///
/// `params.prompt` already holds the final prompt. Cancellation is cooperative:
/// implementations watch `cancel` at every suspension point and run their own
/// backend-specific abort (abort endpoint, socket close, job cancel) when it fires.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Name reported on `/v1/models`.
    async fn model_name(&self) -> Result<String>;

    /// Clamp parameters to what the backend can serve. Runs before the prompt is fitted.
    fn adjust_params(&self, _params: &mut GenerationParams) {}

    /// Single request, full text back. Returns [`GenerationCancelled`] when `cancel` fires first.
    async fn generate_blocking(
        &self,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String>;

    /// Push text into `tx` as it is produced and finish with a `stop` event.
    ///
    /// Mid-stream failures are sent as `Err` items; an `Err` return means the
    /// backend rejected the request before any text was produced.
    async fn generate_streaming(
        &self,
        params: &GenerationParams,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> Result<()>;
}
