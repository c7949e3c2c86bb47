//! Request handling services.

pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod single_flight;

pub use completion::{CompletionService, CompletionStream, PreparedRequest};
pub use config::ProxyConfig;
pub use dispatcher::{BackendDispatcher, FALLBACK_MODEL_NAME};
pub use single_flight::{FlightPermit, SingleFlight};
