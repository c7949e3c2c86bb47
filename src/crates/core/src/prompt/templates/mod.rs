//! Prompt formats.
//!
//! Every format is a [`TemplateStyle`] table fed through the shared
//! [`builder::assemble`]; the registry maps configuration names to them.

pub mod builder;
pub mod styles;

pub use builder::{Delimiters, NameStyle, StyleContext, TemplateStyle};

use crate::prompt::classifier::ClassifiedConversation;
use crate::service::config::ProxyConfig;
use crate::util::errors::{ProxyError, ProxyResult};
use tavern_proxy_core_types::{BackendKind, GenerationParams, PromptSegment};

/// Turns a classified conversation into ordered prompt segments.
///
/// `params` is the per-request generation config; templates may lower
/// `max_length` and add stop strings, and must not touch anything else.
pub trait PromptTemplate: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(
        &self,
        conversation: &ClassifiedConversation,
        options: &TemplateOptions,
        params: &mut GenerationParams,
    ) -> Vec<PromptSegment>;
}

/// Configuration values templates read.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateOptions {
    pub keep_example_messages: bool,
    pub always_keep_first_assistant_example: bool,
    pub reply_attributes: String,
    pub character_bias: String,
    pub impersonation_prompt: String,
    pub silent_message: String,
    pub jailbreak: String,
    pub impersonation_max_new_tokens: u32,
    pub backend: Option<BackendKind>,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default(), None)
    }
}

impl TemplateOptions {
    pub fn from_config(config: &ProxyConfig, backend: Option<BackendKind>) -> Self {
        Self {
            keep_example_messages: config.keep_example_messages_in_prompt,
            always_keep_first_assistant_example: config.always_keep_first_assistant_example,
            reply_attributes: config.reply_attributes.clone(),
            character_bias: config.character_bias.clone(),
            impersonation_prompt: config.impersonation_prompt.clone(),
            silent_message: config.silent_message.clone(),
            jailbreak: config.jailbreak.clone(),
            impersonation_max_new_tokens: config.impersonation_max_new_tokens,
            backend,
        }
    }
}

type StyleFn = fn(&StyleContext<'_>) -> TemplateStyle;

pub struct StyledTemplate {
    name: &'static str,
    style: StyleFn,
}

impl PromptTemplate for StyledTemplate {
    fn name(&self) -> &'static str {
        self.name
    }

    fn build(
        &self,
        conversation: &ClassifiedConversation,
        options: &TemplateOptions,
        params: &mut GenerationParams,
    ) -> Vec<PromptSegment> {
        builder::assemble(self.style, conversation, options, params)
    }
}

static TEMPLATES: [StyledTemplate; 7] = [
    StyledTemplate {
        name: "verbose",
        style: styles::verbose,
    },
    StyledTemplate {
        name: "verbose-alt",
        style: styles::verbose_alt,
    },
    StyledTemplate {
        name: "wizard",
        style: styles::wizard,
    },
    StyledTemplate {
        name: "vicuna-cocktail",
        style: styles::vicuna_cocktail,
    },
    StyledTemplate {
        name: "bluemoon",
        style: styles::bluemoon,
    },
    StyledTemplate {
        name: "metharme",
        style: styles::metharme,
    },
    StyledTemplate {
        name: "llama",
        style: styles::llama,
    },
];

pub fn template_names() -> Vec<&'static str> {
    TEMPLATES.iter().map(|template| template.name).collect()
}

pub fn get_template(name: &str) -> ProxyResult<&'static dyn PromptTemplate> {
    TEMPLATES
        .iter()
        .find(|template| template.name == name)
        .map(|template| template as &dyn PromptTemplate)
        .ok_or_else(|| {
            ProxyError::config(format!(
                "unknown prompt_format '{}', expected one of: {}",
                name,
                template_names().join(", ")
            ))
        })
}
