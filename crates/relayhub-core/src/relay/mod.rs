//! Endpoint-specific relay instances and the per-request session that drives them.

mod chat;
mod completions;
mod embeddings;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use relayhub_protocol::sse::data_frame;
use relayhub_provider_core::{
    ApiError, Endpoint, Provider, UpstreamBody, UpstreamCtx, UpstreamFailure,
};

use crate::guard::Downstream;
use crate::tokenizer::TokenizeError;
use crate::upstream_client::UpstreamClient;
use crate::usage::Usage;

pub use chat::ChatRelay;
pub use completions::CompletionsRelay;
pub use embeddings::EmbeddingsRelay;

/// One endpoint family: parses the caller body and reads usage out of upstream replies.
pub trait Relay: Send + Sync {
    fn endpoint(&self) -> Endpoint;

    /// Parses and validates the caller body. Errors are client-input class.
    fn set_request(&mut self, body: &[u8]) -> Result<(), ApiError>;

    /// Model named by the caller, before any channel mapping. Empty until parsed.
    fn original_model(&self) -> &str;

    fn is_stream(&self) -> bool;

    fn prompt_tokens(&self) -> Result<u32, TokenizeError>;

    /// Request body for the upstream, carrying `model` in place of the caller's model.
    fn upstream_body(&self, model: &str) -> Result<JsonValue, ApiError>;

    /// Reads usage or generated text from a complete (non-streaming) upstream body.
    fn observe_body(&self, body: &[u8], usage: &mut Usage);

    /// Reads usage or generated text from one streamed `data:` payload.
    fn observe_event(&self, _data: &str, _usage: &mut Usage) {}
}

/// Failed attempt. `done` marks failures no other channel can fix.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub error: ApiError,
    pub done: bool,
}

impl AttemptFailure {
    pub fn retryable(error: ApiError) -> Self {
        Self { error, done: false }
    }

    pub fn done(error: ApiError) -> Self {
        Self { error, done: true }
    }
}

/// A parsed request bound to its current provider.
pub struct RelaySession {
    relay: Box<dyn Relay>,
    provider: Option<Provider>,
    downstream: Arc<Downstream>,
    first_response: Option<Duration>,
}

impl RelaySession {
    pub fn new(relay: Box<dyn Relay>, downstream: Arc<Downstream>) -> Self {
        Self {
            relay,
            provider: None,
            downstream,
            first_response: None,
        }
    }

    pub fn relay(&self) -> &dyn Relay {
        self.relay.as_ref()
    }

    pub fn set_request(&mut self, body: &[u8]) -> Result<(), ApiError> {
        self.relay.set_request(body)
    }

    pub fn original_model(&self) -> &str {
        self.relay.original_model()
    }

    pub fn is_stream(&self) -> bool {
        self.relay.is_stream()
    }

    pub fn set_provider(&mut self, provider: Provider) {
        self.provider = Some(provider);
    }

    pub fn provider(&self) -> Option<&Provider> {
        self.provider.as_ref()
    }

    /// Latency to the first upstream byte of the last successful attempt.
    pub fn first_response_time(&self) -> Option<Duration> {
        self.first_response
    }

    /// Runs one upstream call and forwards its reply to the caller.
    pub async fn send(
        &mut self,
        client: &dyn UpstreamClient,
        ctx: &UpstreamCtx,
        usage: &mut Usage,
    ) -> Result<(), AttemptFailure> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            AttemptFailure::done(ApiError::unavailable("no provider bound to request"))
        })?;
        let body = self
            .relay
            .upstream_body(provider.model())
            .map_err(AttemptFailure::done)?;
        let is_stream = self.relay.is_stream();
        let request = provider
            .build_request(ctx, self.relay.endpoint(), body, is_stream)
            .await
            .map_err(|err| AttemptFailure::retryable(ApiError::from(err)))?;

        let started = Instant::now();
        self.first_response = None;
        let response = client
            .send(request)
            .await
            .map_err(|failure| AttemptFailure::retryable(ApiError::from(&failure)))?;

        if !(200..300).contains(&response.status) {
            let body = match response.body {
                UpstreamBody::Bytes(bytes) => bytes,
                UpstreamBody::Stream(rx) => collect_error_body(rx).await,
            };
            return Err(AttemptFailure::retryable(ApiError::from_upstream(
                response.status,
                &body,
            )));
        }

        match response.body {
            UpstreamBody::Bytes(bytes) => {
                self.first_response = Some(started.elapsed());
                self.relay.observe_body(&bytes, usage);
                if self.downstream.has_written() {
                    // A keep-alive already opened the stream; deliver the body as one event.
                    let frame = data_frame(&String::from_utf8_lossy(&bytes));
                    self.downstream.write_data(frame).await;
                } else {
                    self.downstream.send_json(response.status, bytes);
                }
                Ok(())
            }
            UpstreamBody::Stream(rx) => {
                stream::forward(
                    self.relay.as_ref(),
                    rx,
                    &self.downstream,
                    usage,
                    started,
                    &mut self.first_response,
                )
                .await
            }
        }
    }

    /// Error reply for a response that has not started.
    pub fn handle_json_error(&self, err: &ApiError) -> bool {
        self.downstream.send_json(err.status_code, err.to_json_bytes())
    }

    /// Terminal event for a stream that is already open.
    pub async fn handle_stream_error(&self, err: &ApiError) -> bool {
        self.downstream.write_data(err.to_stream_frame()).await
    }
}

async fn collect_error_body(
    mut rx: tokio::sync::mpsc::Receiver<Result<Bytes, UpstreamFailure>>,
) -> Bytes {
    let mut body = Vec::new();
    while let Some(Ok(chunk)) = rx.recv().await {
        body.extend_from_slice(&chunk);
    }
    Bytes::from(body)
}

fn invalid_body(err: serde_json::Error) -> ApiError {
    ApiError::client_input("invalid_request_error", format!("invalid request body: {err}"))
}

fn require_model(model: &str) -> Result<(), ApiError> {
    if model.trim().is_empty() {
        return Err(ApiError::client_input(
            "invalid_request_error",
            "model is required",
        ));
    }
    Ok(())
}

fn encode_body<T: serde::Serialize>(request: Option<&T>, model: &str) -> Result<JsonValue, ApiError> {
    let request = request.ok_or_else(|| {
        ApiError::local(
            500,
            "relayhub_error",
            "request was not parsed",
            relayhub_provider_core::ErrorClass::ClientInput,
        )
    })?;
    let mut value = serde_json::to_value(request).map_err(|err| {
        ApiError::client_input("invalid_request_error", format!("request encode failed: {err}"))
    })?;
    if let Some(object) = value.as_object_mut() {
        object.insert("model".to_string(), JsonValue::String(model.to_string()));
    }
    Ok(value)
}
