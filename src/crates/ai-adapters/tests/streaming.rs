use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tavern_proxy_ai_adapters::horde::{HordeModel, HordeSnapshot};
use tavern_proxy_ai_adapters::{
    BackendAdapter, GenerationCancelled, HordeAdapter, HordeClient, HordeSettings, HordeState,
    KoboldAdapter, LlamaCppAdapter, LlamaCppPythonAdapter, OobaAdapter,
};
use tavern_proxy_core_types::{BackendKind, GenerationParams, StreamEvent};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn collect(mut rx: mpsc::UnboundedReceiver<anyhow::Result<StreamEvent>>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event.expect("stream should not fail"));
    }
    events
}

fn params(prompt: &str, max_length: u32) -> GenerationParams {
    GenerationParams {
        prompt: prompt.to_string(),
        max_length,
        ..GenerationParams::default()
    }
}

#[derive(Clone, Default)]
struct KoboldState {
    prompts: Arc<Mutex<Vec<String>>>,
    max_lengths: Arc<Mutex<Vec<u64>>>,
}

async fn kobold_generate(State(state): State<KoboldState>, Json(body): Json<Value>) -> Json<Value> {
    let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
    let round = {
        let mut prompts = state.prompts.lock().unwrap();
        prompts.push(prompt);
        prompts.len()
    };
    state
        .max_lengths
        .lock()
        .unwrap()
        .push(body["max_length"].as_u64().unwrap_or_default());
    let text = match round {
        1 => "Hello",
        2 => " world",
        _ => "",
    };
    Json(json!({"results": [{"text": text}]}))
}

#[tokio::test]
async fn koboldcpp_pseudo_stream_feeds_output_back_into_prompt() {
    let state = KoboldState::default();
    let app = Router::new()
        .route("/api/v1/generate", post(kobold_generate))
        .with_state(state.clone());
    let url = serve(app).await;

    let adapter = KoboldAdapter::new(reqwest::Client::new(), url, BackendKind::KoboldCpp);
    let (tx, rx) = mpsc::unbounded_channel();
    adapter
        .generate_streaming(&params("P", 24), tx, CancellationToken::new())
        .await
        .expect("pseudo-stream should succeed");

    let events = collect(rx).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::text("Hello"),
            StreamEvent::text(" world"),
            StreamEvent::stop()
        ]
    );
    assert_eq!(
        *state.prompts.lock().unwrap(),
        vec!["P", "PHello", "PHello world"]
    );
    assert!(state.max_lengths.lock().unwrap().iter().all(|len| *len == 8));
}

#[tokio::test]
async fn kobold_pseudo_stream_uses_one_full_chunk() {
    let state = KoboldState::default();
    let app = Router::new()
        .route("/api/v1/generate", post(kobold_generate))
        .with_state(state.clone());
    let url = serve(app).await;

    let adapter = KoboldAdapter::new(reqwest::Client::new(), url, BackendKind::Kobold);
    let (tx, rx) = mpsc::unbounded_channel();
    adapter
        .generate_streaming(&params("P", 80), tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(collect(rx).await, vec![StreamEvent::text("Hello"), StreamEvent::stop()]);
    assert_eq!(*state.max_lengths.lock().unwrap(), vec![80]);
}

#[tokio::test]
async fn llama_cpp_streams_sse_frames() {
    let app = Router::new().route(
        "/completion",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["stream"], true);
            assert_eq!(body["n_predict"], 16);
            let frames = vec![
                Ok::<_, Infallible>(Event::default().data(r#"{"content":"Hi","stop":false}"#)),
                Ok(Event::default().data(r#"{"content":" there","stop":true}"#)),
            ];
            Sse::new(futures::stream::iter(frames))
        }),
    );
    let url = serve(app).await;

    let adapter = LlamaCppAdapter::new(reqwest::Client::new(), url);
    let (tx, rx) = mpsc::unbounded_channel();
    adapter
        .generate_streaming(&params("P", 16), tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        collect(rx).await,
        vec![
            StreamEvent::text("Hi"),
            StreamEvent {
                text: " there".to_string(),
                stop: true
            }
        ]
    );
}

#[tokio::test]
async fn llama_cpp_python_blocking_reads_first_choice() {
    let app = Router::new().route(
        "/v1/completions",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["stream"], false);
            assert_eq!(body["max_tokens"], 32);
            Json(json!({"choices": [{"text": " Sure.", "finish_reason": "stop"}]}))
        }),
    );
    let url = serve(app).await;

    let adapter = LlamaCppPythonAdapter::new(reqwest::Client::new(), url);
    let text = adapter
        .generate_blocking(&params("P", 32), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(text, " Sure.");
}

async fn ooba_socket(mut socket: WebSocket) {
    let Some(Ok(Message::Text(request))) = socket.recv().await else {
        return;
    };
    let request: Value = serde_json::from_str(&request).unwrap();
    assert_eq!(request["max_new_tokens"], 40);
    for frame in [
        json!({"event": "text_stream", "message_num": 0, "text": "One"}),
        json!({"event": "text_stream", "message_num": 1, "text": " two"}),
        json!({"event": "stream_end", "message_num": 2}),
    ] {
        if socket.send(Message::Text(frame.to_string())).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn ooba_streams_websocket_events() {
    let app = Router::new().route(
        "/api/v1/stream",
        get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(ooba_socket) }),
    );
    let url = serve(app).await;
    let stream_url = format!("{}/api/v1/stream", url.replacen("http", "ws", 1));

    let adapter = OobaAdapter::new(reqwest::Client::new(), url, stream_url);
    let (tx, rx) = mpsc::unbounded_channel();
    adapter
        .generate_streaming(&params("P", 40), tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        collect(rx).await,
        vec![
            StreamEvent::text("One"),
            StreamEvent::text(" two"),
            StreamEvent::stop()
        ]
    );
}

#[tokio::test]
async fn ooba_cancel_interrupts_a_stalled_handshake() {
    // Accepts the TCP connection but never answers the websocket upgrade.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let adapter = OobaAdapter::new(
        reqwest::Client::new(),
        format!("http://{addr}"),
        format!("ws://{addr}/api/v1/stream"),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::time::timeout(
        Duration::from_secs(2),
        adapter.generate_streaming(&params("P", 40), tx, cancel),
    )
    .await
    .expect("cancel should not wait for the handshake")
    .unwrap();
    assert!(collect(rx).await.is_empty());
}

#[derive(Clone, Default)]
struct HordeMock {
    polls: Arc<AtomicUsize>,
    deleted: Arc<Mutex<Vec<String>>>,
    submitted: Arc<Mutex<Vec<Value>>>,
    never_finish: bool,
}

async fn horde_submit(State(mock): State<HordeMock>, Json(body): Json<Value>) -> impl IntoResponse {
    mock.submitted.lock().unwrap().push(body);
    (axum::http::StatusCode::ACCEPTED, Json(json!({"id": "job-1"})))
}

async fn horde_status(State(mock): State<HordeMock>, Path(id): Path<String>) -> Json<Value> {
    assert_eq!(id, "job-1");
    let poll = mock.polls.fetch_add(1, Ordering::SeqCst);
    if mock.never_finish || poll == 0 {
        return Json(json!({"done": false, "processing": 0, "waiting": 1, "queue_position": 3}));
    }
    Json(json!({
        "done": true,
        "kudos": 10.0,
        "generations": [{"text": " From the horde.", "worker_name": "w", "model": "m1"}]
    }))
}

async fn horde_cancel(State(mock): State<HordeMock>, Path(id): Path<String>) -> Json<Value> {
    mock.deleted.lock().unwrap().push(id);
    Json(json!({"done": false, "generations": []}))
}

async fn horde_adapter(mock: HordeMock) -> (HordeAdapter, Arc<HordeState>) {
    let app = Router::new()
        .route("/generate/text/async", post(horde_submit))
        .route(
            "/generate/text/status/:id",
            get(horde_status).delete(horde_cancel),
        )
        .with_state(mock);
    let url = serve(app).await;

    let settings = HordeSettings {
        enable: true,
        api_url: url.clone(),
        models: vec!["m".to_string()],
        ..HordeSettings::default()
    };
    let state = Arc::new(HordeState::new());
    state.replace(HordeSnapshot {
        online: true,
        models: vec![HordeModel {
            name: "m1".to_string(),
            kind: "text".to_string(),
            count: 1,
        }],
        ..HordeSnapshot::default()
    });
    let client = HordeClient::from_settings(reqwest::Client::new(), &settings);
    let adapter = HordeAdapter::new(client, settings, state.clone())
        .with_poll_interval(Duration::from_millis(10));
    (adapter, state)
}

#[tokio::test]
async fn horde_polls_until_done() {
    let mock = HordeMock::default();
    let (adapter, state) = horde_adapter(mock.clone()).await;

    let text = adapter
        .generate_blocking(&params("Prompt", 50), CancellationToken::new())
        .await
        .expect("horde job should finish");

    assert_eq!(text, " From the horde.");
    assert_eq!(mock.polls.load(Ordering::SeqCst), 2);
    assert!(state.last_job_id().is_none());
    let submitted = mock.submitted.lock().unwrap();
    assert_eq!(submitted[0]["prompt"], "Prompt");
    assert_eq!(submitted[0]["models"], json!(["m1"]));
}

#[tokio::test]
async fn horde_cancellation_deletes_the_job() {
    let mock = HordeMock {
        never_finish: true,
        ..HordeMock::default()
    };
    let (adapter, state) = horde_adapter(mock.clone()).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = adapter
        .generate_blocking(&params("Prompt", 50), cancel)
        .await
        .expect_err("cancelled job should fail");
    assert!(err.is::<GenerationCancelled>());
    assert_eq!(*mock.deleted.lock().unwrap(), vec!["job-1"]);
    assert!(state.last_job_id().is_none());
}

#[tokio::test]
async fn horde_offline_fails_fast() {
    let (adapter, state) = horde_adapter(HordeMock::default()).await;
    state.replace(HordeSnapshot::default());

    let err = adapter
        .generate_blocking(&params("Prompt", 50), CancellationToken::new())
        .await
        .expect_err("offline horde should fail");
    assert_eq!(err.to_string(), "Horde is offline.");
}
