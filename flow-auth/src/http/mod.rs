//! HTTP client building with middleware.

mod client;
mod retry;

pub use client::{AuthenticatedClient, HttpClientBuilder, HttpClientConfig};
pub use retry::BackoffPolicy;
