//! Proxy configuration.
//!
//! Loaded once at startup from a TOML file and shared read-only afterwards.
//! Every field has a default so an empty file (or no file) is a working setup.

use crate::util::errors::{ProxyError, ProxyResult};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tavern_proxy_ai_adapters::{BackendEndpoints, HordeSettings};
use tavern_proxy_core_types::{BackendKind, GenerationParams};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,

    /// Name of the prompt template, see [`crate::prompt::templates::template_names`].
    pub prompt_format: String,
    /// JSON file with Kobold-style sampling settings.
    pub generation_preset: Option<PathBuf>,
    pub max_context_length: u32,
    pub max_new_tokens: u32,
    pub impersonation_max_new_tokens: u32,
    /// May contain `{{user}}` and `{{char}}`.
    pub stopping_strings: Vec<String>,

    pub keep_example_messages_in_prompt: bool,
    pub always_keep_first_assistant_example: bool,
    pub drop_unfinished_sentences: bool,

    pub kobold_api_url: String,
    pub ooba_stream_url: String,
    pub llama_cpp_url: String,
    pub llama_cpp_python_url: String,
    /// Skips discovery when set.
    pub backend_type: Option<BackendKind>,

    pub reply_attributes: String,
    pub character_bias: String,
    pub include_character_bias_in_output: bool,
    pub impersonation_prompt: String,
    pub silent_message: String,
    pub jailbreak: String,

    pub stream_by_character: bool,
    pub always_scan_stop_strings: bool,
    pub find_partial_stopping_strings: bool,
    pub keep_alive_deltas: usize,
    pub pseudo_stream_chunk_tokens: u32,
    pub kobold_ui_streaming: bool,

    pub cors: bool,
    pub tokenizer_path: PathBuf,
    pub superbig_api: Option<String>,

    pub horde: HordeSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let endpoints = BackendEndpoints::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: 29172,
            prompt_format: "verbose".to_string(),
            generation_preset: None,
            max_context_length: 2048,
            max_new_tokens: 250,
            impersonation_max_new_tokens: 150,
            stopping_strings: vec!["\n##".to_string(), "\n{{user}}:".to_string()],
            keep_example_messages_in_prompt: false,
            always_keep_first_assistant_example: true,
            drop_unfinished_sentences: true,
            kobold_api_url: endpoints.kobold_api_url,
            ooba_stream_url: endpoints.ooba_stream_url,
            llama_cpp_url: endpoints.llama_cpp_url,
            llama_cpp_python_url: endpoints.llama_cpp_python_url,
            backend_type: None,
            reply_attributes:
                " (2 paragraphs, engaging, natural, authentic, descriptive, creative)".to_string(),
            character_bias: String::new(),
            include_character_bias_in_output: true,
            impersonation_prompt:
                "Write {{user}}'s next reply in this fictional roleplay with {{char}}.".to_string(),
            silent_message: String::new(),
            jailbreak: String::new(),
            stream_by_character: true,
            always_scan_stop_strings: false,
            find_partial_stopping_strings: true,
            keep_alive_deltas: 20,
            pseudo_stream_chunk_tokens: 8,
            kobold_ui_streaming: false,
            cors: false,
            tokenizer_path: PathBuf::from("tokenizer.json"),
            superbig_api: None,
            horde: HordeSettings::default(),
        }
    }
}

impl ProxyConfig {
    pub fn from_toml_str(text: &str) -> ProxyResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Loads `path`, or `config.toml` when no path is given.
    ///
    /// A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> ProxyResult<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() {
            if explicit {
                return Err(ProxyError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!("No {} found, using built-in defaults", DEFAULT_CONFIG_FILE);
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn endpoints(&self) -> BackendEndpoints {
        BackendEndpoints {
            kobold_api_url: self.kobold_api_url.clone(),
            ooba_stream_url: self.ooba_stream_url.clone(),
            llama_cpp_url: self.llama_cpp_url.clone(),
            llama_cpp_python_url: self.llama_cpp_python_url.clone(),
        }
    }

    /// Base sampling parameters for one request.
    ///
    /// Starts from the preset file when one is configured; context size,
    /// reply length and stop strings always come from this config.
    pub fn generation_params(&self) -> ProxyResult<GenerationParams> {
        let mut params = match &self.generation_preset {
            Some(path) => load_preset(path)?,
            None => GenerationParams::default(),
        };
        params.max_context_length = self.max_context_length;
        params.max_length = self.max_new_tokens;
        params.stopping_strings = self.stopping_strings.clone();
        Ok(params)
    }
}

pub fn load_preset(path: &Path) -> ProxyResult<GenerationParams> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::config(format!(
            "failed to read generation preset {}: {}",
            path.display(),
            e
        ))
    })?;
    parse_preset(&text)
}

pub fn parse_preset(text: &str) -> ProxyResult<GenerationParams> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ProxyConfig::from_toml_str("").unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.port, 29172);
        assert_eq!(config.stopping_strings, vec!["\n##", "\n{{user}}:"]);
        assert_eq!(config.horde.api_key, "0000000000");
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config = ProxyConfig::from_toml_str(
            r#"
            prompt_format = "wizard"
            backend_type = "llama.cpp"
            max_context_length = 4096

            [horde]
            enable = true
            models = ["koboldcpp/"]
            "#,
        )
        .unwrap();
        assert_eq!(config.prompt_format, "wizard");
        assert_eq!(config.backend_type, Some(BackendKind::LlamaCpp));
        assert_eq!(config.max_context_length, 4096);
        assert!(config.horde.enable);
        assert!(config.horde.slow_workers);
        assert_eq!(config.horde.models, vec!["koboldcpp/"]);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = ProxyConfig::from_toml_str("port = \"high\"").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn missing_explicit_file_fails() {
        let err = ProxyConfig::load(Some(Path::new("/nonexistent/tavern-proxy.toml"))).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn preset_values_are_overridden_by_config() {
        let preset = parse_preset(r#"{"temperature": 0.9, "max_length": 80, "singleline": true}"#).unwrap();
        assert_eq!(preset.temperature, Some(0.9));

        let config = ProxyConfig {
            max_new_tokens: 300,
            ..ProxyConfig::default()
        };
        let mut params = config.generation_params().unwrap();
        assert_eq!(params.max_length, 300);
        assert_eq!(params.stopping_strings, config.stopping_strings);

        params = preset;
        assert_eq!(params.extra.get("singleline"), Some(&serde_json::Value::Bool(true)));
    }
}
