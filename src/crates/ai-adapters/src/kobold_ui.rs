//! Streaming through KoboldAI's browser-UI socket.
//!
//! Older KoboldAI builds only stream tokens to their own web UI, over
//! Socket.IO v4 (Engine.IO framing on a WebSocket). The proxy drives that UI
//! channel like a browser would: reset the story, force the UI options it
//! needs, load the prompt, submit, then diff the growing `Selected Text` of
//! the story action into stream events.

use crate::adapter::{EventSender, GenerationCancelled};
use crate::http::{ensure_success, join_url};
use anyhow::{anyhow, bail, Result};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use reqwest::header::SET_COOKIE;
use serde_json::{json, Map, Value};
use tavern_proxy_core_types::{GenerationParams, StreamEvent};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum Packet {
    Open,
    Ping,
    Close,
    Connected,
    ConnectError(String),
    Event { name: String, data: Value },
    Ack { id: u64, data: Value },
    Other,
}

fn split_ack_id(body: &str) -> (Option<u64>, &str) {
    let digits = body.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (None, body);
    }
    (body[..digits].parse().ok(), &body[digits..])
}

fn parse_packet(frame: &str) -> Packet {
    let mut chars = frame.chars();
    match chars.next() {
        Some('0') => return Packet::Open,
        Some('1') => return Packet::Close,
        Some('2') => return Packet::Ping,
        Some('4') => {}
        _ => return Packet::Other,
    }
    let socket_packet = &frame[1..];
    let Some(kind) = socket_packet.chars().next() else {
        return Packet::Other;
    };
    let body = &socket_packet[kind.len_utf8()..];
    match kind {
        '0' => Packet::Connected,
        '1' => Packet::Close,
        '4' => Packet::ConnectError(body.to_string()),
        '2' => {
            let (_, payload) = split_ack_id(body);
            let Ok(Value::Array(mut items)) = serde_json::from_str::<Value>(payload) else {
                return Packet::Other;
            };
            if items.is_empty() {
                return Packet::Other;
            }
            let data = if items.len() > 1 { items.remove(1) } else { Value::Null };
            match items.remove(0) {
                Value::String(name) => Packet::Event { name, data },
                _ => Packet::Other,
            }
        }
        '3' => {
            let (id, payload) = split_ack_id(body);
            let Some(id) = id else {
                return Packet::Other;
            };
            let data = match serde_json::from_str::<Value>(payload) {
                Ok(Value::Array(mut items)) if !items.is_empty() => items.remove(0),
                _ => Value::Null,
            };
            Packet::Ack { id, data }
        }
        _ => Packet::Other,
    }
}

fn event_frame(ack_id: Option<u64>, event: &str, data: &Value) -> String {
    let payload = Value::Array(vec![Value::String(event.to_string()), data.clone()]);
    match ack_id {
        Some(id) => format!("42{}{}", id, payload),
        None => format!("42{}", payload),
    }
}

/// Deep merge where arrays and scalars from `patch` replace the target.
fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// UI settings that must hold before a prompt is submitted.
fn desired_options(params: &GenerationParams) -> Value {
    let mut options = json!({
        "model": {
            "simple_creativity": 0,
            "simple_randomness": 0,
            "simple_repitition": 0,
            "selected_preset": "",
            "alt_multi_gen": false,
            "numseqs": 1,
            "use_alt_rep_pen": false,
            "genamt": params.max_length,
            "max_length": params.max_context_length,
        },
        "story": {
            "actionmode": 0,
            "adventure": false,
            "authornote": "",
            "authornote_length": 0,
            "auto_memory": "",
            "autosave": false,
            "biases": {},
            "chat_style": 0,
            "chatmode": false,
            "commentary_enabled": false,
            "dynamicscan": false,
            "editln": 0,
            "gamesaved": true,
            "gamestarted": false,
            "gen_audio": false,
            "lastact": "",
            "lastctx": "",
            "memory": "",
            "mode": "play",
            "notes": "",
            "picture": "",
            "picture_prompt": "",
            "prompt_length": 0,
            "storymode": 0,
            "submission": "",
            "useprompt": false,
            "stop_sequence": params.stopping_strings,
        },
        "system": {
            "alt_gen": false,
            "disable_input_formatting": true,
            "disable_output_formatting": true,
            "full_determinism": false,
            "has_genmod": false,
            "quiet": false,
        },
        "user": {
            "formatoptns": {
                "frmttriminc": false,
                "frmtrmblln": false,
                "frmtrmspch": false,
                "frmtadsnsp": false,
                "singleline": false,
            },
            "frmtadsnsp": false,
            "frmtrmblln": false,
            "frmtrmspch": false,
            "frmttriminc": false,
            "nogenmod": false,
            "nopromptgen": false,
            "output_streaming": true,
            "remove_double_space": false,
            "rngpersist": false,
            "singleline": false,
            "ui_level": 2,
            "wirmvwhtsp": false,
        },
    });

    let mut sampling = Map::new();
    let numeric = [
        ("rep_pen", params.rep_pen),
        ("rep_pen_slope", params.rep_pen_slope),
        ("temp", params.temperature),
        ("tfs", params.tfs),
        ("top_a", params.top_a),
        ("top_p", params.top_p),
        ("typical", params.typical),
    ];
    for (name, value) in numeric {
        if let Some(value) = value {
            sampling.insert(name.to_string(), json!(value));
        }
    }
    if let Some(range) = params.rep_pen_range {
        sampling.insert("rep_pen_range".to_string(), json!(range));
    }
    if let Some(top_k) = params.top_k {
        sampling.insert("top_k".to_string(), json!(top_k));
    }
    if let Some(order) = &params.sampler_order {
        sampling.insert("sampler_order".to_string(), json!(order));
    }
    merge_json(&mut options["model"], Value::Object(sampling));

    match params.sampler_seed {
        Some(seed) if seed >= 0 => {
            options["system"]["seed_specified"] = json!(true);
            options["system"]["seed"] = json!(seed);
        }
        _ => options["system"]["seed_specified"] = json!(false),
    }

    options
}

fn options_loaded(state: &Value, desired: &Value) -> bool {
    let Some(classes) = desired.as_object() else {
        return true;
    };
    classes.iter().all(|(classname, names)| {
        names.as_object().map_or(true, |names| {
            names
                .iter()
                .all(|(name, value)| state.get(classname).and_then(|c| c.get(name)) == Some(value))
        })
    })
}

fn socket_url(base_url: &str) -> String {
    let ws_base = base_url.trim_end_matches('/').replacen("http", "ws", 1);
    format!("{}/socket.io/?ui=2&EIO=4&transport=websocket", ws_base)
}

async fn fetch_ui_cookie(client: &reqwest::Client, base_url: &str) -> Result<String> {
    let response = client.get(join_url(base_url, "/new_ui")).send().await?;
    let response = ensure_success(response).await?;
    let cookie = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .unwrap_or("")
        .to_string();
    Ok(cookie)
}

struct SocketIoClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_ack_id: u64,
}

impl SocketIoClient {
    async fn connect(url: &str, cookie: &str) -> Result<Self> {
        let mut request = url.into_client_request()?;
        if !cookie.is_empty() {
            request
                .headers_mut()
                .insert("Cookie", HeaderValue::from_str(cookie)?);
        }
        let (ws, _) = connect_async(request).await?;
        let mut client = Self { ws, next_ack_id: 0 };

        match client.next_packet().await? {
            Some(Packet::Open) => {}
            other => bail!("unexpected Engine.IO handshake: {:?}", other),
        }
        client.send_raw("40".to_string()).await?;
        loop {
            match client.next_packet().await? {
                Some(Packet::Connected) => return Ok(client),
                Some(Packet::ConnectError(message)) => {
                    bail!("Kobold UI socket refused connection: {}", message)
                }
                Some(Packet::Close) | None => bail!("Kobold UI socket closed during handshake"),
                Some(_) => continue,
            }
        }
    }

    async fn send_raw(&mut self, frame: String) -> Result<()> {
        trace!("Kobold UI >> {}", frame);
        self.ws.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn emit(&mut self, event: &str, data: &Value) -> Result<()> {
        self.send_raw(event_frame(None, event, data)).await
    }

    async fn emit_with_ack(&mut self, event: &str, data: &Value) -> Result<u64> {
        let id = self.next_ack_id;
        self.next_ack_id += 1;
        self.send_raw(event_frame(Some(id), event, data)).await?;
        Ok(id)
    }

    /// Next Socket.IO packet, answering Engine.IO pings on the way.
    async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let Some(message) = self.ws.next().await else {
                return Ok(None);
            };
            match message? {
                Message::Text(frame) => {
                    trace!("Kobold UI << {}", frame);
                    match parse_packet(&frame) {
                        Packet::Ping => self.send_raw("3".to_string()).await?,
                        Packet::Other => continue,
                        packet => return Ok(Some(packet)),
                    }
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
    }

    async fn close(mut self) {
        let _ = self.send_raw("41".to_string()).await;
        let _ = self.ws.close(None).await;
    }
}

struct UiSession<'a> {
    socket: SocketIoClient,
    state: Value,
    desired: Value,
    output: String,
    story_reset: bool,
    loading_options: bool,
    streaming: bool,
    tx: &'a EventSender,
}

impl<'a> UiSession<'a> {
    fn aibusy(&self) -> Option<bool> {
        self.state
            .get("system")
            .and_then(|system| system.get("aibusy"))
            .and_then(Value::as_bool)
    }

    fn noai(&self) -> bool {
        self.state
            .get("system")
            .and_then(|system| system.get("noai"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Option<u64>> {
        match packet {
            Packet::Ack { id, data } => {
                trace!("Kobold UI ack {}: {}", id, data);
                Ok(Some(id))
            }
            Packet::Event { name, data } => {
                match name.as_str() {
                    "reset_story" => self.story_reset = true,
                    "var_changed" => self.on_var_changed(data).await?,
                    _ => {}
                }
                Ok(None)
            }
            Packet::ConnectError(message) => bail!("Kobold UI socket error: {}", message),
            Packet::Close => bail!("Disconnected"),
            _ => Ok(None),
        }
    }

    async fn on_var_changed(&mut self, data: Value) -> Result<()> {
        let Some(classname) = data.get("classname").and_then(Value::as_str).map(str::to_string)
        else {
            return Ok(());
        };
        let Some(name) = data.get("name").and_then(Value::as_str).map(str::to_string) else {
            return Ok(());
        };
        let value = data.get("value").cloned().unwrap_or(Value::Null);
        let transmit_time = data.get("transmit_time").cloned().unwrap_or(Value::Null);

        merge_json(
            &mut self.state,
            json!({ classname.clone(): { name.clone(): value.clone(), "time": transmit_time } }),
        );

        if self.loading_options {
            if let Some(desired) = self.desired.get(&classname).and_then(|c| c.get(&name)) {
                if *desired != value {
                    debug!(
                        "Kobold UI option {}_{} is {} but {} is required",
                        classname, name, value, desired
                    );
                    let change = json!({ "ID": format!("{}_{}", classname, name), "value": desired });
                    self.socket.emit_with_ack("var_change", &change).await?;
                }
            }
        }

        if self.streaming && classname == "story" && name == "actions" {
            let selected = value
                .get("action")
                .and_then(|action| action.get("Selected Text"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if let Some(suffix) = selected.get(self.output.len()..) {
                if !suffix.is_empty() {
                    let suffix = suffix.to_string();
                    self.output.push_str(&suffix);
                    let _ = self.tx.send(Ok(StreamEvent::text(suffix)));
                }
            }
        }
        Ok(())
    }

    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<u64>> {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationCancelled.into()),
            packet = self.socket.next_packet() => packet?,
        };
        match packet {
            Some(packet) => self.handle_packet(packet).await,
            None => Err(anyhow!("Disconnected")),
        }
    }

    async fn emit_and_wait(&mut self, event: &str, data: Value, cancel: &CancellationToken) -> Result<()> {
        let id = self.socket.emit_with_ack(event, &data).await?;
        loop {
            if self.next(cancel).await? == Some(id) {
                return Ok(());
            }
        }
    }

    async fn wait_until<F>(&mut self, cancel: &CancellationToken, done: F) -> Result<()>
    where
        F: Fn(&Self) -> bool,
    {
        while !done(&*self) {
            self.next(cancel).await?;
        }
        Ok(())
    }

    async fn run(&mut self, prompt: &str, cancel: &CancellationToken) -> Result<()> {
        self.emit_and_wait("update_tokens", json!(""), cancel).await?;
        self.emit_and_wait("new_story", json!(""), cancel).await?;
        debug!("Waiting for Kobold story reset");
        self.wait_until(cancel, |s| s.story_reset).await?;

        debug!("Loading Kobold UI options");
        self.loading_options = true;
        self.wait_until(cancel, |s| {
            s.aibusy() == Some(false) && options_loaded(&s.state, &s.desired)
        })
        .await?;
        self.loading_options = false;
        if self.noai() {
            bail!("No model loaded.");
        }

        self.emit_and_wait(
            "var_change",
            json!({ "ID": "story_prompt", "value": prompt }),
            cancel,
        )
        .await?;
        self.emit_and_wait("Set Selected Text", json!({ "id": 0, "text": "" }), cancel)
            .await?;

        self.streaming = true;
        self.socket
            .emit_with_ack("submit", &json!({ "data": "", "theme": "" }))
            .await?;

        debug!("Waiting for Kobold generation to start");
        self.wait_until(cancel, |s| s.aibusy() == Some(true)).await?;
        debug!("Waiting for Kobold generation to stop");
        self.wait_until(cancel, |s| s.aibusy() == Some(false)).await?;

        let _ = self.tx.send(Ok(StreamEvent::stop()));
        Ok(())
    }
}

/// Streams one generation through the UI socket of a KoboldAI server at `base_url`.
pub async fn stream_generation(
    client: &reqwest::Client,
    base_url: &str,
    params: &GenerationParams,
    tx: &EventSender,
    cancel: &CancellationToken,
) -> Result<()> {
    let cookie = fetch_ui_cookie(client, base_url).await?;
    let socket = SocketIoClient::connect(&socket_url(base_url), &cookie).await?;
    debug!("Kobold UI socket connected");

    let mut session = UiSession {
        socket,
        state: Value::Object(Map::new()),
        desired: desired_options(params),
        output: String::new(),
        story_reset: false,
        loading_options: false,
        streaming: false,
        tx,
    };

    let result = session.run(&params.prompt, cancel).await;
    let result = match result {
        Err(e) if e.is::<GenerationCancelled>() => {
            if session.streaming {
                debug!("Aborting Kobold UI generation");
                if let Err(e) = session.socket.emit("abort", &json!("")).await {
                    warn!("Failed to send abort to Kobold UI socket: {}", e);
                }
            }
            Ok(())
        }
        other => other,
    };
    session.socket.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_io_and_socket_io_packets() {
        assert_eq!(parse_packet(r#"0{"sid":"abc"}"#), Packet::Open);
        assert_eq!(parse_packet("2"), Packet::Ping);
        assert_eq!(parse_packet(r#"40{"sid":"x"}"#), Packet::Connected);
        assert_eq!(
            parse_packet(r#"42["var_changed",{"classname":"system"}]"#),
            Packet::Event {
                name: "var_changed".to_string(),
                data: json!({"classname": "system"})
            }
        );
        assert_eq!(
            parse_packet(r#"4312["ok"]"#),
            Packet::Ack {
                id: 12,
                data: json!("ok")
            }
        );
        assert_eq!(
            parse_packet(r#"42["reset_story"]"#),
            Packet::Event {
                name: "reset_story".to_string(),
                data: Value::Null
            }
        );
    }

    #[test]
    fn event_frames_carry_ack_ids() {
        assert_eq!(event_frame(None, "abort", &json!("")), r#"42["abort",""]"#);
        assert_eq!(
            event_frame(Some(3), "submit", &json!({"data": ""})),
            r#"423["submit",{"data":""}]"#
        );
    }

    #[test]
    fn merge_replaces_arrays_and_recurses_objects() {
        let mut state = json!({"model": {"numseqs": 2, "sampler_order": [1, 2]}, "system": {}});
        merge_json(
            &mut state,
            json!({"model": {"sampler_order": [3]}, "system": {"aibusy": false}}),
        );
        assert_eq!(
            state,
            json!({"model": {"numseqs": 2, "sampler_order": [3]}, "system": {"aibusy": false}})
        );
    }

    #[test]
    fn options_loaded_requires_every_desired_value() {
        let desired = json!({"model": {"numseqs": 1}, "user": {"ui_level": 2}});
        let mut state = json!({"model": {"numseqs": 1}});
        assert!(!options_loaded(&state, &desired));
        merge_json(&mut state, json!({"user": {"ui_level": 2, "time": 1.0}}));
        assert!(options_loaded(&state, &desired));
    }

    #[test]
    fn desired_options_follow_params() {
        let params = GenerationParams {
            max_length: 80,
            sampler_seed: Some(7),
            stopping_strings: vec!["\nYou:".to_string()],
            ..GenerationParams::default()
        };
        let options = desired_options(&params);
        assert_eq!(options["model"]["genamt"], 80);
        assert_eq!(options["model"]["max_length"], 2048);
        assert_eq!(options["model"]["temp"], 0.65);
        assert_eq!(options["story"]["stop_sequence"], json!(["\nYou:"]));
        assert_eq!(options["system"]["seed_specified"], true);
        assert_eq!(options["system"]["seed"], 7);
    }

    #[test]
    fn socket_url_switches_scheme() {
        assert_eq!(
            socket_url("http://127.0.0.1:5000/"),
            "ws://127.0.0.1:5000/socket.io/?ui=2&EIO=4&transport=websocket"
        );
        assert_eq!(
            socket_url("https://kobold.example"),
            "wss://kobold.example/socket.io/?ui=2&EIO=4&transport=websocket"
        );
    }
}
