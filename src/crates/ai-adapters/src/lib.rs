//! Backend protocol adapters.
//!
//! Each adapter speaks one text-generation backend's native protocol
//! (REST, SSE, WebSocket, Socket.IO or Horde's job queue) behind the
//! [`BackendAdapter`] trait.

pub mod adapter;
pub mod discovery;
pub mod horde;
pub mod http;
pub mod kobold;
pub mod kobold_ui;
pub mod llama_cpp;
pub mod ooba;
pub mod params;
pub mod stream_handler;
pub mod superbig;

pub use adapter::{BackendAdapter, BackendEndpoints, EventSender, GenerationCancelled};
pub use discovery::{discover_backend, DiscoveredBackend};
pub use horde::{HordeAdapter, HordeClient, HordeSettings, HordeState};
pub use kobold::KoboldAdapter;
pub use llama_cpp::{LlamaCppAdapter, LlamaCppPythonAdapter};
pub use ooba::OobaAdapter;
pub use superbig::SuperBigClient;
