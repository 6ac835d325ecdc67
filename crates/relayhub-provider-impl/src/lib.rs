//! Built-in wire adapters.
//!
//! This crate does not perform network IO. It builds `UpstreamHttpRequest`s for the
//! OpenAI-compatible channel types.

mod auth_headers;
mod azure;
mod openai;

use std::sync::Arc;

use relayhub_provider_core::AdapterRegistry;

pub use azure::AzureAdapter;
pub use openai::OpenAiCompatAdapter;

pub fn builtin_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(OpenAiCompatAdapter::new()));
    registry.register(Arc::new(AzureAdapter::new()));
    registry
}
