//! Shared DTOs for the Tavern proxy.
//!
//! Everything in here is plain data: chat messages as received from the
//! front-end, the prompt segments built from them, generation parameters,
//! backend identifiers and the OpenAI-compatible wire shapes.

pub mod backend;
pub mod chat;
pub mod generation;
pub mod openai;
pub mod segment;

pub use backend::BackendKind;
pub use chat::{ChatMessage, ChatRole, RoleNames};
pub use generation::{GenerationParams, StreamEvent};
pub use openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelCard, ModelList,
};
pub use segment::{MessageMetadata, PromptSegment, SegmentKind, TaggedMessage};
