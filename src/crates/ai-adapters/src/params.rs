//! Projection of [`GenerationParams`] into each backend's request body.

use log::warn;
use serde_json::{Map, Value};
use tavern_proxy_core_types::{BackendKind, GenerationParams};

fn to_object(params: &GenerationParams) -> Map<String, Value> {
    match serde_json::to_value(params) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!("Generation params serialized to a non-object: {}", other);
            Map::new()
        }
        Err(e) => {
            warn!("Failed to serialize generation params: {}", e);
            Map::new()
        }
    }
}

fn rename(map: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = map.remove(from) {
        map.insert(to.to_string(), value);
    }
}

fn apply_renames(map: &mut Map<String, Value>, renames: &[(&str, &str)]) {
    for (from, to) in renames {
        rename(map, from, to);
    }
}

/// `POST /api/v1/generate` body for KoboldAI and koboldcpp.
///
/// KoboldAI rejects unknown stop fields, koboldcpp calls them `stop_sequence`.
pub fn kobold_payload(params: &GenerationParams, kind: BackendKind) -> Value {
    let mut map = to_object(params);
    match kind {
        BackendKind::KoboldCpp | BackendKind::Horde => {
            rename(&mut map, "stopping_strings", "stop_sequence");
        }
        _ => {
            map.remove("stopping_strings");
        }
    }
    Value::Object(map)
}

/// Body for text-generation-webui's blocking and streaming APIs.
pub fn ooba_payload(params: &GenerationParams) -> Value {
    let mut map = to_object(params);
    apply_renames(
        &mut map,
        &[
            ("max_length", "max_new_tokens"),
            ("rep_pen", "repetition_penalty"),
            ("typical", "typical_p"),
            ("sampler_seed", "seed"),
            ("max_context_length", "truncation_length"),
        ],
    );
    Value::Object(map)
}

/// `POST /completion` body for the llama.cpp example server.
pub fn llama_cpp_payload(params: &GenerationParams, stream: bool) -> Value {
    let mut map = to_object(params);
    apply_renames(
        &mut map,
        &[
            ("max_length", "n_predict"),
            ("rep_pen", "repeat_penalty"),
            ("rep_pen_range", "repeat_last_n"),
            ("tfs", "tfs_z"),
            ("typical", "typical_p"),
            ("sampler_seed", "seed"),
            ("stopping_strings", "stop"),
        ],
    );
    for unsupported in ["max_context_length", "rep_pen_slope", "sampler_order", "top_a"] {
        map.remove(unsupported);
    }
    map.insert("stream".to_string(), Value::Bool(stream));
    Value::Object(map)
}

/// `POST /v1/completions` body for llama-cpp-python.
pub fn llama_cpp_python_payload(params: &GenerationParams, stream: bool) -> Value {
    let mut map = to_object(params);
    apply_renames(
        &mut map,
        &[
            ("max_length", "max_tokens"),
            ("rep_pen", "repeat_penalty"),
            ("stopping_strings", "stop"),
        ],
    );
    for unsupported in [
        "max_context_length",
        "rep_pen_range",
        "rep_pen_slope",
        "sampler_order",
        "sampler_seed",
        "top_a",
        "typical",
        "tfs",
    ] {
        map.remove(unsupported);
    }
    map.insert("stream".to_string(), Value::Bool(stream));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GenerationParams {
        GenerationParams {
            prompt: "Hello".to_string(),
            stopping_strings: vec!["\n##".to_string()],
            sampler_seed: Some(42),
            ..GenerationParams::default()
        }
    }

    #[test]
    fn kobold_drops_stop_strings() {
        let payload = kobold_payload(&params(), BackendKind::Kobold);
        assert!(payload.get("stopping_strings").is_none());
        assert!(payload.get("stop_sequence").is_none());
        assert_eq!(payload["max_length"], 250);
        assert_eq!(payload["prompt"], "Hello");
    }

    #[test]
    fn koboldcpp_renames_stop_strings() {
        let payload = kobold_payload(&params(), BackendKind::KoboldCpp);
        assert_eq!(payload["stop_sequence"], serde_json::json!(["\n##"]));
        assert!(payload.get("stopping_strings").is_none());
    }

    #[test]
    fn ooba_uses_native_names() {
        let payload = ooba_payload(&params());
        assert_eq!(payload["max_new_tokens"], 250);
        assert_eq!(payload["truncation_length"], 2048);
        assert_eq!(payload["repetition_penalty"], 1.08);
        assert_eq!(payload["seed"], 42);
        assert_eq!(payload["stopping_strings"], serde_json::json!(["\n##"]));
        assert!(payload.get("max_length").is_none());
    }

    #[test]
    fn llama_cpp_uses_native_names() {
        let payload = llama_cpp_payload(&params(), true);
        assert_eq!(payload["n_predict"], 250);
        assert_eq!(payload["repeat_penalty"], 1.08);
        assert_eq!(payload["repeat_last_n"], 1024);
        assert_eq!(payload["tfs_z"], 0.9);
        assert_eq!(payload["stop"], serde_json::json!(["\n##"]));
        assert_eq!(payload["stream"], true);
        assert!(payload.get("max_context_length").is_none());
    }

    #[test]
    fn llama_cpp_python_uses_openai_names() {
        let payload = llama_cpp_python_payload(&params(), false);
        assert_eq!(payload["max_tokens"], 250);
        assert_eq!(payload["stop"], serde_json::json!(["\n##"]));
        assert_eq!(payload["stream"], false);
        assert!(payload.get("sampler_order").is_none());
    }

    #[test]
    fn extra_preset_keys_are_forwarded() {
        let mut params = params();
        params
            .extra
            .insert("singleline".to_string(), Value::Bool(true));
        let payload = kobold_payload(&params, BackendKind::Kobold);
        assert_eq!(payload["singleline"], true);
    }
}
