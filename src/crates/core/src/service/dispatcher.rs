//! Backend selection.
//!
//! The backend is resolved once per process, from `backend_type`, the Horde
//! switch, or discovery. A failed discovery is not cached.

use crate::service::config::ProxyConfig;
use crate::util::errors::{ProxyError, ProxyResult};
use log::{info, warn};
use std::sync::Arc;
use tavern_proxy_ai_adapters::http::build_http_client;
use tavern_proxy_ai_adapters::{
    discover_backend, BackendAdapter, HordeAdapter, HordeClient, HordeState, KoboldAdapter,
    LlamaCppAdapter, LlamaCppPythonAdapter, OobaAdapter,
};
use tavern_proxy_core_types::BackendKind;
use tokio::sync::OnceCell;

/// Reported on `/v1/models` when the backend cannot tell its model name.
pub const FALLBACK_MODEL_NAME: &str = "kobold";

pub struct BackendDispatcher {
    config: Arc<ProxyConfig>,
    http: reqwest::Client,
    horde_state: Arc<HordeState>,
    adapter: OnceCell<Arc<dyn BackendAdapter>>,
}

impl BackendDispatcher {
    pub fn new(config: Arc<ProxyConfig>, horde_state: Arc<HordeState>) -> Self {
        Self::with_http_client(config, horde_state, build_http_client())
    }

    pub fn with_http_client(
        config: Arc<ProxyConfig>,
        horde_state: Arc<HordeState>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            http,
            horde_state,
            adapter: OnceCell::new(),
        }
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn horde_state(&self) -> Arc<HordeState> {
        self.horde_state.clone()
    }

    pub fn horde_client(&self) -> HordeClient {
        HordeClient::from_settings(self.http.clone(), &self.config.horde)
    }

    /// The resolved adapter, probing backends on first use.
    pub async fn adapter(&self) -> ProxyResult<Arc<dyn BackendAdapter>> {
        self.adapter
            .get_or_try_init(|| self.resolve())
            .await
            .cloned()
    }

    async fn resolve(&self) -> ProxyResult<Arc<dyn BackendAdapter>> {
        let (kind, kobold_api_url) = if let Some(kind) = self.config.backend_type {
            info!("Using configured backend: {}", kind);
            (kind, self.config.kobold_api_url.clone())
        } else {
            let found = discover_backend(
                &self.http,
                &self.config.endpoints(),
                self.config.horde.enable,
            )
            .await
            .map_err(|e| ProxyError::BackendUnavailable(format!("{:#}", e)))?;
            (found.kind, found.kobold_api_url)
        };
        Ok(self.build_adapter(kind, &kobold_api_url))
    }

    pub fn build_adapter(&self, kind: BackendKind, kobold_api_url: &str) -> Arc<dyn BackendAdapter> {
        let config = &self.config;
        match kind {
            BackendKind::Kobold | BackendKind::KoboldCpp => Arc::new(
                KoboldAdapter::new(self.http.clone(), kobold_api_url, kind)
                    .with_chunk_tokens(config.pseudo_stream_chunk_tokens)
                    .with_ui_streaming(config.kobold_ui_streaming),
            ),
            BackendKind::Ooba => Arc::new(OobaAdapter::new(
                self.http.clone(),
                kobold_api_url,
                config.ooba_stream_url.clone(),
            )),
            BackendKind::LlamaCpp => Arc::new(LlamaCppAdapter::new(
                self.http.clone(),
                config.llama_cpp_url.clone(),
            )),
            BackendKind::LlamaCppPython => Arc::new(LlamaCppPythonAdapter::new(
                self.http.clone(),
                config.llama_cpp_python_url.clone(),
            )),
            BackendKind::Horde => Arc::new(HordeAdapter::new(
                self.horde_client(),
                config.horde.clone(),
                self.horde_state.clone(),
            )),
        }
    }

    /// Kind of the resolved backend, if resolution already happened.
    pub fn resolved_kind(&self) -> Option<BackendKind> {
        self.adapter.get().map(|adapter| adapter.kind())
    }

    /// Model name for `/v1/models`; never fails.
    pub async fn model_name(&self) -> String {
        let adapter = match self.adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("No backend for model listing: {}", e);
                return FALLBACK_MODEL_NAME.to_string();
            }
        };
        match adapter.model_name().await {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => FALLBACK_MODEL_NAME.to_string(),
            Err(e) => {
                warn!("Failed to read model name from {}: {:#}", adapter.kind(), e);
                FALLBACK_MODEL_NAME.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(config: ProxyConfig) -> BackendDispatcher {
        BackendDispatcher::new(Arc::new(config), Arc::new(HordeState::new()))
    }

    #[tokio::test]
    async fn configured_backend_skips_discovery() {
        let dispatcher = dispatcher(ProxyConfig {
            backend_type: Some(BackendKind::LlamaCpp),
            ..ProxyConfig::default()
        });
        assert_eq!(dispatcher.resolved_kind(), None);
        let adapter = dispatcher.adapter().await.unwrap();
        assert_eq!(adapter.kind(), BackendKind::LlamaCpp);
        assert_eq!(dispatcher.resolved_kind(), Some(BackendKind::LlamaCpp));
    }

    #[tokio::test]
    async fn horde_switch_selects_horde() {
        let mut config = ProxyConfig::default();
        config.horde.enable = true;
        let adapter = dispatcher(config).adapter().await.unwrap();
        assert_eq!(adapter.kind(), BackendKind::Horde);
    }

    #[tokio::test]
    async fn unreachable_backends_fall_back_for_model_name() {
        let dispatcher = dispatcher(ProxyConfig {
            kobold_api_url: "http://127.0.0.1:9/".to_string(),
            llama_cpp_url: "http://127.0.0.1:9".to_string(),
            llama_cpp_python_url: "http://127.0.0.1:9".to_string(),
            ..ProxyConfig::default()
        });
        let err = dispatcher.adapter().await.err().unwrap();
        assert!(matches!(err, ProxyError::BackendUnavailable(_)));
        assert_eq!(dispatcher.model_name().await, FALLBACK_MODEL_NAME);
        assert_eq!(dispatcher.resolved_kind(), None);
    }
}
