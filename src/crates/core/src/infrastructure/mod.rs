pub mod tokenizer;

pub use tokenizer::{load_token_counter, EstimatingCounter, HfTokenCounter, TokenCounter};
