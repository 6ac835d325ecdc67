mod admin;
mod proxy;

use std::sync::Arc;

use axum::Router;

use relayhub_core::{MemoryAuth, RelayEngine};

pub use admin::admin_router;
pub use proxy::{RelayState, relay_router};

/// Relay endpoints plus the status/channel endpoints, sharing one auth snapshot.
pub fn app_router(engine: Arc<RelayEngine>, auth: Arc<MemoryAuth>) -> Router {
    let state = RelayState { engine, auth };
    relay_router(state.clone()).merge(admin_router(state))
}
