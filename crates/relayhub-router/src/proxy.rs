use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use relayhub_core::{
    AuthError, DownstreamReply, InboundRequest, MemoryAuth, RelayEngine, TokenContext,
};
use relayhub_provider_core::{ApiError, ErrorClass};

#[derive(Clone)]
pub struct RelayState {
    pub engine: Arc<RelayEngine>,
    pub auth: Arc<MemoryAuth>,
}

#[derive(Clone)]
struct RequestTraceId(String);

pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/v1/{*path}", post(relay_post))
        .layer(middleware::from_fn_with_state(state.clone(), relay_auth))
        .with_state(state)
}

pub(crate) async fn relay_auth(
    State(state): State<RelayState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let trace_id = uuid::Uuid::now_v7().to_string();

    let token = match state.auth.authenticate(req.headers()) {
        Ok(token) => token,
        Err(err) => {
            warn!(
                event = "downstream_auth_rejected",
                trace_id = %trace_id,
                path = %req.uri().path(),
                status = err.status.as_u16(),
                reason = err.message
            );
            return auth_error_response(&err);
        }
    };

    // Downstream credentials never travel further than this layer.
    strip_downstream_auth_headers(req.headers_mut());
    req.extensions_mut().insert(RequestTraceId(trace_id));
    req.extensions_mut().insert(token);
    next.run(req).await
}

async fn relay_post(
    State(state): State<RelayState>,
    Extension(token): Extension<TokenContext>,
    Extension(RequestTraceId(trace_id)): Extension<RequestTraceId>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    // The engine task is detached: it keeps running (and settles quota) if the caller leaves.
    let (reply, _task) = state.engine.spawn(InboundRequest {
        path: uri.path().to_string(),
        body,
        token,
        trace_id: trace_id.clone(),
        user_agent,
    });

    match reply.await {
        Ok(reply) => to_axum_response(reply),
        Err(_) => {
            warn!(event = "relay_task_lost", trace_id = %trace_id);
            let err = ApiError::local(
                500,
                "internal_error",
                "relay task ended without a response",
                ErrorClass::GatewayUnavailable,
            );
            json_response(err.status_code, err.to_json_bytes())
        }
    }
}

fn auth_error_response(err: &AuthError) -> Response {
    let err = ApiError::local(
        err.status.as_u16(),
        "authentication_error",
        err.message,
        ErrorClass::ClientInput,
    );
    json_response(err.status_code, err.to_json_bytes())
}

fn to_axum_response(reply: DownstreamReply) -> Response {
    match reply {
        DownstreamReply::Json { status, body } => json_response(status, body),
        DownstreamReply::Stream { body } => {
            let stream = ReceiverStream::new(body).map(Ok::<_, Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            let h = resp.headers_mut();
            h.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            // Hint common reverse proxies to avoid buffering SSE responses.
            h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            h.insert(
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            );
            resp
        }
    }
}

fn json_response(status: u16, body: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

fn strip_downstream_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
}
