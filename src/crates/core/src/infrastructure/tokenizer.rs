//! Token counting.
//!
//! Counts only need to be close to the backend's own tokenizer: they decide
//! which prompt segments fit into the context window.

use crate::util::errors::{ProxyError, ProxyResult};
use log::{debug, warn};
use std::path::Path;
use tokenizers::Tokenizer;

/// Characters per token assumed when no tokenizer file is available.
const CHARS_PER_TOKEN: f64 = 3.35;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn count_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|text| self.count(text)).collect()
    }
}

/// Length-based estimate, `ceil(chars / 3.35)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatingCounter;

impl TokenCounter for EstimatingCounter {
    fn count(&self, text: &str) -> usize {
        (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as usize
    }
}

/// A Hugging Face `tokenizer.json` tokenizer.
pub struct HfTokenCounter {
    tokenizer: Tokenizer,
}

impl HfTokenCounter {
    pub fn from_file(path: &Path) -> ProxyResult<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            ProxyError::Tokenizer(format!(
                "Failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self { tokenizer })
    }
}

impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(e) => {
                warn!("Tokenizer failed, estimating instead: {}", e);
                EstimatingCounter.count(text)
            }
        }
    }
}

/// Loads the tokenizer at `path`, falling back to the estimator.
pub fn load_token_counter(path: &Path) -> Box<dyn TokenCounter> {
    match HfTokenCounter::from_file(path) {
        Ok(counter) => {
            debug!("Tokenizer loaded from {}", path.display());
            Box::new(counter)
        }
        Err(e) => {
            warn!("{}; token counts will be estimated", e);
            Box::new(EstimatingCounter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(EstimatingCounter.count(""), 0);
        assert_eq!(EstimatingCounter.count("abc"), 1);
        assert_eq!(EstimatingCounter.count("abcd"), 2);
        assert_eq!(EstimatingCounter.count(&"x".repeat(10)), 3);
    }

    #[test]
    fn batch_keeps_order() {
        assert_eq!(EstimatingCounter.count_batch(&["", "abcdefgh", "a"]), vec![0, 3, 1]);
    }

    #[test]
    fn missing_tokenizer_falls_back() {
        let counter = load_token_counter(Path::new("/nonexistent/tokenizer.json"));
        assert_eq!(counter.count("abcd"), 2);
    }
}
