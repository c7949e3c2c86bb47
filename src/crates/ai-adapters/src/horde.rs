//! KoboldAI Horde: a crowd-sourced job queue instead of a local server.
//!
//! A generation is submitted as an async job and polled until a worker
//! finishes it. [`HordeState`] caches the status, model and worker lists that
//! the server refreshes periodically, plus the id of the job in flight.

use crate::adapter::{BackendAdapter, EventSender, GenerationCancelled};
use crate::http::join_url;
use crate::params::kobold_payload;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tavern_proxy_core_types::{BackendKind, GenerationParams, StreamEvent};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HORDE_API_URL: &str = "https://horde.koboldai.net/api/v2";
pub const ANONYMOUS_API_KEY: &str = "0000000000";
const CLIENT_AGENT: &str = concat!("tavern-proxy:", env!("CARGO_PKG_VERSION"), ":local");
const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HordeSettings {
    pub enable: bool,
    pub api_url: String,
    pub api_key: String,
    /// Model name prefixes, matched case-insensitively.
    pub models: Vec<String>,
    /// Worker ids to restrict the job to.
    pub workers: Vec<String>,
    pub only_trusted: bool,
    pub slow_workers: bool,
    pub softprompt: Option<String>,
    pub auto_adjust_max_new_tokens: bool,
    pub auto_adjust_max_context: bool,
}

impl Default for HordeSettings {
    fn default() -> Self {
        Self {
            enable: false,
            api_url: DEFAULT_HORDE_API_URL.to_string(),
            api_key: ANONYMOUS_API_KEY.to_string(),
            models: Vec::new(),
            workers: Vec::new(),
            only_trusted: false,
            slow_workers: true,
            softprompt: None,
            auto_adjust_max_new_tokens: true,
            auto_adjust_max_context: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HordeUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub kudos: f64,
    #[serde(default)]
    pub pseudonymous: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HordeModes {
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub invite_only_mode: bool,
}

fn text_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HordeModel {
    pub name: String,
    #[serde(rename = "type", default = "text_type")]
    pub kind: String,
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HordeWorker {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "text_type")]
    pub kind: String,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub max_length: u32,
    #[serde(default)]
    pub max_context_length: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobGeneration {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub worker_name: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub faulted: bool,
    #[serde(default)]
    pub processing: u32,
    #[serde(default)]
    pub waiting: u32,
    #[serde(default)]
    pub queue_position: u32,
    #[serde(default)]
    pub wait_time: u32,
    #[serde(default)]
    pub is_possible: bool,
    #[serde(default)]
    pub kudos: f64,
    #[serde(default)]
    pub generations: Vec<JobGeneration>,
}

#[derive(Debug, Deserialize)]
struct JobSubmitted {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HordeMessage {
    #[serde(default)]
    message: String,
}

async fn horde_error(response: Response) -> anyhow::Error {
    let status = response.status();
    let message = response
        .json::<HordeMessage>()
        .await
        .map(|body| body.message)
        .unwrap_or_default();
    if message.is_empty() {
        anyhow!("Horde returned HTTP {}", status)
    } else {
        anyhow!("Horde returned HTTP {}: {}", status, message)
    }
}

/// REST client for the Horde v2 API.
#[derive(Clone)]
pub struct HordeClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HordeClient {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_settings(http: reqwest::Client, settings: &HordeSettings) -> Self {
        Self::new(http, settings.api_url.clone(), settings.api_key.clone())
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(join_url(&self.api_url, path))
            .header("Client-Agent", CLIENT_AGENT)
            .header("Accept", "application/json")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).send().await?;
        if !response.status().is_success() {
            return Err(horde_error(response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn heartbeat(&self) -> Result<bool> {
        let response = self.get("/status/heartbeat").send().await?;
        Ok(response.status().is_success())
    }

    /// `None` when the API key is unknown to the Horde.
    pub async fn find_user(&self) -> Result<Option<HordeUser>> {
        let response = self
            .get("/find_user")
            .header("apikey", &self.api_key)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => {
                debug!("Horde user not found for the configured API key");
                Ok(None)
            }
            _ => Err(horde_error(response).await),
        }
    }

    pub async fn modes(&self) -> Result<HordeModes> {
        self.get_json("/status/modes").await
    }

    pub async fn models(&self) -> Result<Vec<HordeModel>> {
        self.get_json("/status/models?type=text").await
    }

    pub async fn workers(&self) -> Result<Vec<HordeWorker>> {
        self.get_json("/workers?type=text").await
    }

    /// Queues a text job and returns its id.
    pub async fn submit(&self, payload: &Value) -> Result<String> {
        let response = self
            .http
            .post(join_url(&self.api_url, "/generate/text/async"))
            .header("Client-Agent", CLIENT_AGENT)
            .header("apikey", &self.api_key)
            .json(payload)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED => {
                let submitted: JobSubmitted = response.json().await?;
                Ok(submitted.id)
            }
            _ => Err(horde_error(response).await),
        }
    }

    fn status_path(id: &str) -> String {
        format!("/generate/text/status/{}", urlencoding::encode(id))
    }

    pub async fn status(&self, id: &str) -> Result<Option<JobStatus>> {
        let response = self.get(&Self::status_path(id)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(horde_error(response).await),
        }
    }

    pub async fn cancel(&self, id: &str) -> Result<Option<JobStatus>> {
        let response = self
            .http
            .delete(join_url(&self.api_url, &Self::status_path(id)))
            .header("Client-Agent", CLIENT_AGENT)
            .header("Accept", "application/json")
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(horde_error(response).await),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HordeSnapshot {
    pub online: bool,
    pub user: Option<HordeUser>,
    pub modes: HordeModes,
    pub models: Vec<HordeModel>,
    pub workers: Vec<HordeWorker>,
}

/// Process-lifetime Horde cache shared by the adapter and the refresh task.
#[derive(Debug, Default)]
pub struct HordeState {
    snapshot: RwLock<HordeSnapshot>,
    last_job_id: Mutex<Option<String>>,
}

impl HordeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HordeSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, snapshot: HordeSnapshot) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }

    pub fn last_job_id(&self) -> Option<String> {
        self.last_job_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_last_job_id(&self, id: Option<String>) {
        *self
            .last_job_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
    }

    fn take_last_job_id(&self) -> Option<String> {
        self.last_job_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Re-fetches status, user, modes, models and workers.
    pub async fn refresh(&self, client: &HordeClient) -> Result<()> {
        info!("Fetching Horde info");
        let online = client.heartbeat().await?;
        let user = client.find_user().await?;
        let modes = client.modes().await?;
        let models = client.models().await?;
        let workers = client.workers().await?;

        let mut status = if online { "online" } else { "offline" }.to_string();
        if modes.maintenance_mode {
            status.push_str(", in maintenance");
        }
        if modes.invite_only_mode {
            status.push_str(", in invite only mode");
        }
        info!("Horde status: {}", status);
        match &user {
            Some(user) => info!(
                "Horde user: {}, {} kudos{}",
                user.username,
                user.kudos,
                if user.pseudonymous { "" } else { ", anonymous user" }
            ),
            None => warn!("Horde user not found"),
        }
        debug!(
            "Horde lists refreshed: models={}, workers={}",
            models.len(),
            workers.len()
        );

        self.replace(HordeSnapshot {
            online,
            user,
            modes,
            models,
            workers,
        });
        Ok(())
    }
}

/// Models whose name starts with one of `selected` (case-insensitive).
pub fn filter_models<'a>(models: &'a [HordeModel], selected: &[String]) -> Vec<&'a HordeModel> {
    models
        .iter()
        .filter(|model| model.kind == "text")
        .filter(|model| {
            let name = model.name.to_lowercase();
            selected
                .iter()
                .any(|prefix| name.starts_with(&prefix.to_lowercase()))
        })
        .collect()
}

/// Healthy text workers serving at least one of `models`.
pub fn filter_workers<'a>(
    workers: &'a [HordeWorker],
    models: &[&HordeModel],
    only_trusted: bool,
) -> Vec<&'a HordeWorker> {
    workers
        .iter()
        .filter(|worker| worker.kind == "text")
        .filter(|worker| !worker.flagged && !worker.maintenance_mode && worker.online)
        .filter(|worker| !only_trusted || worker.trusted)
        .filter(|worker| {
            models
                .iter()
                .any(|model| worker.models.iter().any(|name| *name == model.name))
        })
        .collect()
}

/// Clamps `max_length` and `max_context_length` to what every worker supports.
pub fn auto_adjust(settings: &HordeSettings, params: &mut GenerationParams, workers: &[&HordeWorker]) {
    let mut new_tokens = params.max_length;
    let mut max_context = params.max_context_length;
    for worker in workers {
        new_tokens = new_tokens.min(worker.max_length);
        max_context = max_context.min(worker.max_context_length);
    }

    if settings.auto_adjust_max_new_tokens && params.max_length != new_tokens {
        info!("Horde max new tokens set to {}", new_tokens);
        params.max_length = new_tokens;
    }
    if settings.auto_adjust_max_context && params.max_context_length != max_context {
        info!("Horde max context length set to {}", max_context);
        params.max_context_length = max_context;
    }
}

pub struct HordeAdapter {
    client: HordeClient,
    settings: HordeSettings,
    state: Arc<HordeState>,
    poll_interval: Duration,
}

impl HordeAdapter {
    pub fn new(client: HordeClient, settings: HordeSettings, state: Arc<HordeState>) -> Self {
        Self {
            client,
            settings,
            state,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn cancel_previous_job(&self) {
        let Some(previous) = self.state.take_last_job_id() else {
            return;
        };
        info!("Cancelling previous Horde job {}", previous);
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.cancel(&previous).await {
                Ok(_) => info!("Previous Horde job {} cancelled", previous),
                Err(e) => error!("Failed to cancel Horde job {}: {}", previous, e),
            }
        });
    }

    fn build_payload(&self, params: &GenerationParams, models: Vec<String>) -> Value {
        let mut horde_params = kobold_payload(params, BackendKind::Horde);
        if let Value::Object(map) = &mut horde_params {
            map.remove("prompt");
        }
        let mut payload = json!({
            "prompt": params.prompt,
            "params": horde_params,
            "trusted_workers": self.settings.only_trusted,
            "slow_workers": self.settings.slow_workers,
            "models": models,
        });
        if let Some(softprompt) = &self.settings.softprompt {
            payload["softprompt"] = json!(softprompt);
        }
        if !self.settings.workers.is_empty() {
            payload["workers"] = json!(self.settings.workers);
        }
        payload
    }

    async fn cancel_job(&self, id: &str) {
        match self.client.cancel(id).await {
            Ok(_) => info!("Horde job {} cancelled", id),
            Err(e) => error!("Failed to cancel Horde job {}: {}", id, e),
        }
        self.state.set_last_job_id(None);
    }

    async fn run_job(&self, params: &GenerationParams, cancel: &CancellationToken) -> Result<String> {
        let snapshot = self.state.snapshot();
        if !snapshot.online {
            bail!("Horde is offline.");
        }
        if snapshot.modes.maintenance_mode {
            bail!("Horde is in maintenance mode.");
        }

        self.cancel_previous_job();

        let models = filter_models(&snapshot.models, &self.settings.models)
            .into_iter()
            .map(|model| model.name.clone())
            .collect();
        let payload = self.build_payload(params, models);

        let id = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationCancelled.into()),
            id = self.client.submit(&payload) => id?,
        };
        self.state.set_last_job_id(Some(id.clone()));
        info!("Horde job {} submitted", id);

        let started = Instant::now();
        loop {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_job(&id).await;
                    return Err(GenerationCancelled.into());
                }
                status = self.client.status(&id) => status?,
            };
            let Some(status) = status else {
                bail!("Couldn't get Horde job status.");
            };

            if status.done {
                self.state.set_last_job_id(None);
                let generation = status
                    .generations
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("Couldn't get generated text."))?;
                info!(
                    "Generated by {} using {} for {} kudos in {:.2} seconds (max_length={}, max_context_length={})",
                    generation.worker_name,
                    generation.model,
                    status.kudos,
                    started.elapsed().as_secs_f64(),
                    params.max_length,
                    params.max_context_length
                );
                return Ok(generation.text);
            }
            if status.faulted {
                self.state.set_last_job_id(None);
                bail!("Horde returned faulted=true");
            }
            if status.processing == 0 && status.waiting == 0 {
                bail!("Job cancelled.");
            }

            info!(
                "Horde job {}: wait time = {}; queue position = {}; is possible = {}",
                id, status.wait_time, status.queue_position, status.is_possible
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_job(&id).await;
                    return Err(GenerationCancelled.into());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl BackendAdapter for HordeAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Horde
    }

    async fn model_name(&self) -> Result<String> {
        Ok("Horde".to_string())
    }

    fn adjust_params(&self, params: &mut GenerationParams) {
        let snapshot = self.state.snapshot();
        let models = filter_models(&snapshot.models, &self.settings.models);
        let workers = filter_workers(&snapshot.workers, &models, self.settings.only_trusted);
        debug!(
            "Horde selection: models={}, workers={}",
            models.len(),
            workers.len()
        );
        auto_adjust(&self.settings, params, &workers);
    }

    async fn generate_blocking(
        &self,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<String> {
        self.run_job(params, &cancel).await
    }

    async fn generate_streaming(
        &self,
        params: &GenerationParams,
        tx: EventSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        match self.run_job(params, &cancel).await {
            Ok(text) => {
                let _ = tx.send(Ok(StreamEvent::text(text)));
                let _ = tx.send(Ok(StreamEvent::stop()));
                Ok(())
            }
            Err(e) if e.is::<GenerationCancelled>() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
