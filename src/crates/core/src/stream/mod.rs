pub mod holdback;
pub mod normalizer;

pub use holdback::{hold_back, Split};
pub use normalizer::{ClientFrame, NormalizerOptions, NormalizerState, StreamNormalizer};
