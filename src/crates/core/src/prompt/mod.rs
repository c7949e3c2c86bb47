//! Prompt construction: classification, templates, fitting and expansion.

pub mod classifier;
pub mod expansion;
pub mod fitter;
pub mod templates;
pub mod text;

pub use classifier::{classify, ClassifiedConversation, ConversationStats};
pub use fitter::{fit, render};
pub use templates::{get_template, template_names, PromptTemplate, TemplateOptions};
