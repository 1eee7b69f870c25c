mod client;
mod error;
pub mod sse;
pub mod types;

pub use client::{EventStream, ResponsesClient};
pub use error::ApiError;

/// Timeout for HTTP calls to the model provider. Streaming responses can be
/// long-lived, so this only bounds connection setup and request write.
pub(crate) const HTTP_CONNECT_TIMEOUT_SECS: u64 = 30;
