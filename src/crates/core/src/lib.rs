//! Tavern proxy core.
//!
//! Turns an OpenAI-style chat into a prompt for a local text-generation
//! backend and normalizes what comes back:
//!
//! - `prompt`: message classification, templates, context fitting, SuperBIG expansion
//! - `stream`: stop-string hold-back and the client stream state machine
//! - `service`: configuration, backend dispatch, single-flight guard, completions
//! - `infrastructure`: token counting
//! - `util`: errors

pub mod infrastructure;
pub mod prompt;
pub mod service;
pub mod stream;
pub mod util;

pub use infrastructure::{load_token_counter, TokenCounter};
pub use service::{
    BackendDispatcher, CompletionService, CompletionStream, PreparedRequest, ProxyConfig,
    SingleFlight,
};
pub use stream::{ClientFrame, NormalizerState};
pub use util::errors::{ProxyError, ProxyResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
