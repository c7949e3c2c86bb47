//! Error types for the proxy core.

use tavern_proxy_ai_adapters::GenerationCancelled;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request body or message list.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No backend could be identified or reached.
    #[error("{0}")]
    BackendUnavailable(String),

    /// The backend rejected or failed the generation.
    #[error("{0}")]
    Generation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The generation was superseded by a newer request or the client went away.
    #[error("Generation cancelled")]
    Cancelled,
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        ProxyError::InvalidRequest(msg.into())
    }

    pub fn generation(msg: impl Into<String>) -> Self {
        ProxyError::Generation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ProxyError::Config(msg.into())
    }

    /// Maps an adapter error, recognizing cancellation.
    pub fn from_backend(error: anyhow::Error) -> Self {
        if error.is::<GenerationCancelled>() {
            ProxyError::Cancelled
        } else {
            ProxyError::Generation(format!("{:#}", error))
        }
    }

    /// Errors caused by the caller rather than the proxy or its backend.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProxyError::InvalidRequest(_))
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(error: toml::de::Error) -> Self {
        ProxyError::Config(error.to_string())
    }
}
