pub mod errors;

pub use errors::{ProxyError, ProxyResult};
