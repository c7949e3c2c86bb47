use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tavern_proxy_ai_adapters::HordeState;
use tavern_proxy_core::infrastructure::EstimatingCounter;
use tavern_proxy_core::{BackendDispatcher, CompletionService, ProxyConfig};
use tavern_proxy_core_types::BackendKind;
use tavern_proxy_server::{build_router, AppState};
use tokio::net::TcpListener;

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn start_proxy(config: ProxyConfig) -> String {
    let config = Arc::new(config);
    let dispatcher = Arc::new(BackendDispatcher::new(
        config.clone(),
        Arc::new(HordeState::new()),
    ));
    let service = CompletionService::new(config, dispatcher, Arc::new(EstimatingCounter)).unwrap();
    serve(build_router(AppState::new(Arc::new(service)))).await
}

fn koboldcpp_config(url: String) -> ProxyConfig {
    ProxyConfig {
        backend_type: Some(BackendKind::KoboldCpp),
        kobold_api_url: url,
        keep_alive_deltas: 0,
        stream_by_character: false,
        ..ProxyConfig::default()
    }
}

fn chat_body(user_line: &str, stream: bool) -> Value {
    json!({
        "model": "gpt-3.5-turbo",
        "stream": stream,
        "messages": [
            {"role": "system", "content": "Alice|Bob\nAlice is a knight."},
            {"role": "system", "content": "[Start a new chat]"},
            {"role": "assistant", "content": "Halt!"},
            {"role": "user", "content": user_line}
        ]
    })
}

#[derive(Clone, Default)]
struct MockKobold {
    replies: Arc<Mutex<Vec<&'static str>>>,
    aborts: Arc<AtomicUsize>,
    aborts_seen_by_fast: Arc<Mutex<Option<usize>>>,
}

async fn generate(State(state): State<MockKobold>, Json(body): Json<Value>) -> Json<Value> {
    let prompt = body["prompt"].as_str().unwrap_or_default();
    if prompt.contains("slow request") {
        tokio::time::sleep(Duration::from_secs(5)).await;
        return Json(json!({"results": [{"text": "too late"}]}));
    }
    if prompt.contains("quick request") {
        *state.aborts_seen_by_fast.lock().unwrap() = Some(state.aborts.load(Ordering::SeqCst));
    }
    let text = {
        let mut replies = state.replies.lock().unwrap();
        if replies.is_empty() {
            ""
        } else {
            replies.remove(0)
        }
    };
    Json(json!({"results": [{"text": text}]}))
}

async fn abort(State(state): State<MockKobold>) -> Json<Value> {
    state.aborts.fetch_add(1, Ordering::SeqCst);
    Json(json!({"success": true}))
}

async fn mock_backend(replies: &[&'static str]) -> (MockKobold, String) {
    let mock = MockKobold::default();
    mock.replies.lock().unwrap().extend_from_slice(replies);
    let app = Router::new()
        .route("/api/v1/generate", post(generate))
        .route("/api/extra/abort", post(abort))
        .with_state(mock.clone());
    let url = serve(app).await;
    (mock, url)
}

/// Delta contents of an SSE body, plus whether it ended with `[DONE]`.
fn parse_sse(body: &str) -> (Vec<String>, bool) {
    let mut deltas = Vec::new();
    let mut done = false;
    for data in body.lines().filter_map(|line| line.strip_prefix("data: ")) {
        if data == "[DONE]" {
            done = true;
            continue;
        }
        assert!(!done, "frame after [DONE]");
        let chunk: Value = serde_json::from_str(data).unwrap();
        deltas.push(chunk["choices"][0]["delta"]["content"].as_str().unwrap().to_string());
    }
    (deltas, done)
}

#[tokio::test]
async fn blocking_chat_completion() {
    let (_mock, backend) = mock_backend(&[" She bows.\nBob: hi"]).await;
    let proxy = start_proxy(koboldcpp_config(backend)).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/v1/chat/completions"))
        .json(&chat_body("Hello.", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-3.5-turbo");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], " She bows.");
}

#[tokio::test]
async fn streaming_chat_completion() {
    let (_mock, backend) = mock_backend(&[" Hel", "lo.\n##", " ignored"]).await;
    let proxy = start_proxy(koboldcpp_config(backend)).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/v1/chat/completions"))
        .json(&chat_body("Hi.", true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let body = response.text().await.unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));

    let (deltas, done) = parse_sse(&body);
    assert!(done);
    assert_eq!(deltas.concat(), " Hello.");
}

#[tokio::test]
async fn second_request_aborts_the_first_stream() {
    let (mock, backend) = mock_backend(&[" Fast reply."]).await;
    let proxy = start_proxy(koboldcpp_config(backend)).await;
    let client = reqwest::Client::new();

    let slow = {
        let client = client.clone();
        let url = format!("{proxy}/v1/chat/completions");
        tokio::spawn(async move {
            let response = client
                .post(url)
                .json(&chat_body("slow request", true))
                .send()
                .await
                .unwrap();
            response.text().await.unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fast: Value = client
        .post(format!("{proxy}/v1/chat/completions"))
        .json(&chat_body("quick request", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fast["choices"][0]["message"]["content"], " Fast reply.");

    let slow_body = tokio::time::timeout(Duration::from_secs(2), slow)
        .await
        .unwrap()
        .unwrap();
    let (deltas, done) = parse_sse(&slow_body);
    assert!(deltas.is_empty());
    assert!(done);
    assert_eq!(*mock.aborts_seen_by_fast.lock().unwrap(), Some(1));
}

#[tokio::test]
async fn superseded_blocking_request_gets_empty_reply() {
    let (mock, backend) = mock_backend(&[" Fast reply."]).await;
    let proxy = start_proxy(koboldcpp_config(backend)).await;
    let client = reqwest::Client::new();

    let slow = {
        let client = client.clone();
        let url = format!("{proxy}/v1/chat/completions");
        tokio::spawn(async move {
            client
                .post(url)
                .json(&chat_body("slow request", false))
                .send()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let fast: Value = client
        .post(format!("{proxy}/v1/chat/completions"))
        .json(&chat_body("quick request", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fast["choices"][0]["message"]["content"], " Fast reply.");

    let slow = tokio::time::timeout(Duration::from_secs(2), slow)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(slow.status(), StatusCode::OK);
    let body: Value = slow.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "");
    assert_eq!(mock.aborts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn models_fall_back_when_backend_is_unreachable() {
    let proxy = start_proxy(ProxyConfig {
        kobold_api_url: "http://127.0.0.1:9".to_string(),
        llama_cpp_url: "http://127.0.0.1:9".to_string(),
        llama_cpp_python_url: "http://127.0.0.1:9".to_string(),
        ..ProxyConfig::default()
    })
    .await;

    let response = reqwest::get(format!("{proxy}/v1/models")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["id"], "kobold");
    assert_eq!(body["data"][0]["owned_by"], "kobold");
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let proxy = start_proxy(ProxyConfig::default()).await;
    let response = reqwest::get(format!("{proxy}/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["notfound"], true);
    assert!(response_has_no_cors(&proxy).await);
}

async fn response_has_no_cors(proxy: &str) -> bool {
    let response = reqwest::get(format!("{proxy}/v1/unknown")).await.unwrap();
    !response.headers().contains_key("access-control-allow-origin")
}

#[tokio::test]
async fn preflight_gets_cors_headers_when_enabled() {
    let proxy = start_proxy(ProxyConfig {
        cors: true,
        ..ProxyConfig::default()
    })
    .await;

    let response = reqwest::Client::new()
        .request(
            reqwest::Method::OPTIONS,
            format!("{proxy}/v1/chat/completions"),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.headers()["access-control-max-age"], "86400");

    let not_found = reqwest::get(format!("{proxy}/nowhere")).await.unwrap();
    assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
    assert_eq!(not_found.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn preflight_without_cors_has_no_headers() {
    let proxy = start_proxy(ProxyConfig::default()).await;
    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("{proxy}/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let proxy = start_proxy(koboldcpp_config("http://127.0.0.1:9".to_string())).await;
    let client = reqwest::Client::new();

    let empty = client
        .post(format!("{proxy}/v1/chat/completions"))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body: Value = empty.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Invalid request"));

    let malformed = client
        .post(format!("{proxy}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body("{\"messages\": 3")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn backend_failure_is_reported_as_501() {
    let app = Router::new().route(
        "/api/v1/generate",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "out of memory") }),
    );
    let backend = serve(app).await;
    let proxy = start_proxy(koboldcpp_config(backend)).await;

    let response = reqwest::Client::new()
        .post(format!("{proxy}/v1/chat/completions"))
        .json(&chat_body("Hi.", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}
