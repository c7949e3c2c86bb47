use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_MAX_CONTEXT_LENGTH: u32 = 2048;
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 250;

/// Backend-agnostic sampling parameters, named the way Kobold names them.
///
/// Adapters project this into each backend's native request shape. Keys the
/// proxy does not know about are kept in `extra` and forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: u32,
    #[serde(default = "default_max_length")]
    pub max_length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_a: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typical: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tfs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rep_pen: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rep_pen_range: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rep_pen_slope: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler_order: Option<Vec<u32>>,
    /// Negative or absent means a random seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler_seed: Option<i64>,
    #[serde(default)]
    pub stopping_strings: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_max_context_length() -> u32 {
    DEFAULT_MAX_CONTEXT_LENGTH
}

fn default_max_length() -> u32 {
    DEFAULT_MAX_NEW_TOKENS
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_context_length: DEFAULT_MAX_CONTEXT_LENGTH,
            max_length: DEFAULT_MAX_NEW_TOKENS,
            temperature: Some(0.65),
            top_p: Some(0.9),
            top_k: Some(0),
            top_a: Some(0.0),
            typical: Some(1.0),
            tfs: Some(0.9),
            rep_pen: Some(1.08),
            rep_pen_range: Some(1024),
            rep_pen_slope: Some(0.9),
            sampler_order: Some(vec![6, 0, 1, 2, 3, 4, 5]),
            sampler_seed: None,
            stopping_strings: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl GenerationParams {
    /// Token budget left for the prompt once room for the reply is reserved.
    pub fn prompt_budget(&self) -> i64 {
        self.max_context_length as i64 - self.max_length as i64 - 1
    }

    pub fn add_stopping_strings<I, S>(&mut self, strings: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for current in strings {
            let current = current.into();
            if !self.stopping_strings.contains(&current) {
                self.stopping_strings.push(current);
            }
        }
    }
}

/// Unit exchanged between a backend adapter and the streaming normalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub text: String,
    pub stop: bool,
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stop: false,
        }
    }

    pub fn stop() -> Self {
        Self {
            text: String::new(),
            stop: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_keeps_unknown_keys() {
        let params: GenerationParams = serde_json::from_value(serde_json::json!({
            "temperature": 0.7,
            "rep_pen": 1.1,
            "singleline": false,
            "n": 1
        }))
        .expect("preset should parse");
        assert_eq!(params.max_context_length, DEFAULT_MAX_CONTEXT_LENGTH);
        assert_eq!(params.temperature, Some(0.7));
        assert_eq!(params.extra.get("singleline"), Some(&Value::Bool(false)));
        assert_eq!(params.extra.get("n"), Some(&serde_json::json!(1)));
        assert!(params.top_k.is_none());
    }

    #[test]
    fn add_stopping_strings_skips_duplicates() {
        let mut params = GenerationParams::default();
        params.stopping_strings = vec!["\n##".to_string()];
        params.add_stopping_strings(["\n##", "\nUSER:"]);
        assert_eq!(params.stopping_strings, vec!["\n##", "\nUSER:"]);
    }

    #[test]
    fn prompt_budget_reserves_reply_room() {
        let params = GenerationParams::default();
        assert_eq!(params.prompt_budget(), 2048 - 250 - 1);
    }
}
