use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::channel::Channel;
use crate::custom_params::CustomParameters;
use crate::errors::ProviderResult;
use crate::headers::Headers;

/// Upstream body chunks. An `Err` item ends the stream with a transport failure.
pub type ByteStream = tokio::sync::mpsc::Receiver<Result<Bytes, UpstreamFailure>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// Endpoint families the relay serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl Endpoint {
    /// Path relative to an OpenAI-compatible `/v1` base.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "/chat/completions",
            Endpoint::Completions => "/completions",
            Endpoint::Embeddings => "/embeddings",
        }
    }
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamCtx {
    pub trace_id: Option<String>,
    pub attempt_no: u32,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// Transport-level failures (no HTTP response, or the body broke off).
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx HTTP response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

/// Wire adapter for one family of channel types.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn channel_types(&self) -> &'static [crate::channel::ChannelType];

    /// Builds the upstream request. `body` already carries the upstream model name.
    async fn build_request(
        &self,
        ctx: &UpstreamCtx,
        provider: &Provider,
        endpoint: Endpoint,
        body: JsonValue,
        is_stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest>;
}

/// A channel bound to a resolved model for one attempt.
#[derive(Clone)]
pub struct Provider {
    channel: Arc<Channel>,
    original_model: String,
    model: String,
    adapter: Arc<dyn ProviderAdapter>,
}

impl Provider {
    pub fn new(
        channel: Arc<Channel>,
        original_model: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        let original_model = original_model.into();
        let model = channel.upstream_model(&original_model).to_string();
        Self {
            channel,
            original_model,
            model,
            adapter,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Model name as sent upstream, after the channel's model mapping.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn original_model(&self) -> &str {
        &self.original_model
    }

    pub fn custom_parameters(&self) -> ProviderResult<Option<CustomParameters>> {
        CustomParameters::parse(self.channel.custom_parameter.as_deref())
    }

    pub async fn build_request(
        &self,
        ctx: &UpstreamCtx,
        endpoint: Endpoint,
        body: JsonValue,
        is_stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest> {
        self.adapter
            .build_request(ctx, self, endpoint, body, is_stream)
            .await
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("channel_id", &self.channel.id)
            .field("adapter", &self.adapter.name())
            .field("original_model", &self.original_model)
            .field("model", &self.model)
            .finish()
    }
}
