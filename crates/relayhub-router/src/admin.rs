use axum::extract::State;
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use relayhub_common::RelayConfig;
use relayhub_provider_core::ChannelView;

use crate::proxy::{RelayState, relay_auth};

#[derive(Debug, Serialize)]
struct StatusReply {
    status: &'static str,
    version: &'static str,
    channels: usize,
    config: RelayConfig,
}

/// `GET /api/status` is open for health probes; `GET /api/channels` needs a valid token.
pub fn admin_router(state: RelayState) -> Router {
    Router::new()
        .route("/api/channels", get(list_channels))
        .layer(middleware::from_fn_with_state(state.clone(), relay_auth))
        .route("/api/status", get(status))
        .with_state(state)
}

async fn status(State(state): State<RelayState>) -> Json<StatusReply> {
    let channels = state.engine.channels().snapshot().await.len();
    Json(StatusReply {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        channels,
        config: state.engine.config().as_ref().clone(),
    })
}

async fn list_channels(State(state): State<RelayState>) -> Json<Vec<ChannelView>> {
    let mut channels = state.engine.channels().snapshot().await;
    channels.sort_by_key(|view| view.channel.id);
    Json(channels)
}
