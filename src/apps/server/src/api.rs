//! HTTP handlers for the OpenAI-compatible surface.

use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream;
use serde_json::json;
use tavern_proxy_core::{ClientFrame, CompletionStream, ProxyError};
use tavern_proxy_core_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelList,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DONE_MARKER: &str = "[DONE]";
const CORS_MAX_AGE_SECS: &str = "86400";

pub struct ApiError(ProxyError);

impl From<ProxyError> for ApiError {
    fn from(error: ProxyError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            error!("Request failed: {}", self.0);
            StatusCode::NOT_IMPLEMENTED
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let name = state.service.dispatcher().model_name().await;
    debug!("Reporting model {}", name);
    Json(ModelList::new([name]))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ProxyError::invalid_request(e.body_text()))?;
    info!(
        "Chat completion: messages={}, stream={}",
        request.messages.len(),
        request.stream
    );

    let prepared = state.service.prepare(request.messages).await?;
    let model = request
        .model
        .unwrap_or_else(|| prepared.backend().to_string());

    if request.stream {
        let client_cancel = CancellationToken::new();
        let guard = client_cancel.clone().drop_guard();
        let CompletionStream { frames, task: _ } =
            state.service.generate_stream(prepared, client_cancel);

        // The guard lives as long as the response body; a client hanging up
        // drops the body and cancels the generation.
        let events = stream::unfold((frames, guard), |(mut frames, guard)| async move {
            let event = match frames.recv().await? {
                ClientFrame::Delta(text) => Event::default().json_data(ChatCompletionChunk::delta(text)),
                ClientFrame::Done => Ok(Event::default().data(DONE_MARKER)),
            };
            Some((event, (frames, guard)))
        });
        return Ok(Sse::new(events).into_response());
    }

    let content = match state.service.generate(prepared).await {
        Ok(content) => content,
        Err(ProxyError::Cancelled) => {
            info!("Request was superseded, replying with empty text");
            String::new()
        }
        Err(e) => return Err(e.into()),
    };
    let response = ChatCompletionResponse::new(
        format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        chrono::Utc::now().timestamp(),
        model,
        content,
    );
    Ok(Json(response).into_response())
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "notfound": true,
            "text": "You aren't supposed to open this in a browser.",
        })),
    )
}

fn insert_cors_headers(headers: &mut HeaderMap) {
    let any = HeaderValue::from_static("*");
    headers.insert("access-control-allow-origin", any.clone());
    headers.insert("access-control-allow-methods", any.clone());
    headers.insert("access-control-allow-headers", any);
    headers.insert(
        "access-control-max-age",
        HeaderValue::from_static(CORS_MAX_AGE_SECS),
    );
}

/// Answers every `OPTIONS` with 204 and adds the CORS headers to every
/// response when they are enabled.
pub async fn preflight_and_cors(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let cors = state.service.config().cors;
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    if cors {
        insert_cors_headers(response.headers_mut());
    }
    response
}
