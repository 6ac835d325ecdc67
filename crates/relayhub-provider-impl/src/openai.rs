use bytes::Bytes;
use serde_json::{Value as JsonValue, json};

use relayhub_provider_core::{
    ChannelType, Endpoint, HttpMethod, Provider, ProviderAdapter, ProviderError, ProviderResult,
    UpstreamCtx, UpstreamHttpRequest,
};

use crate::auth_headers;

const ADAPTER_NAME: &str = "openai_compat";
const CHANNEL_TYPES: &[ChannelType] = &[
    ChannelType::Openai,
    ChannelType::Deepseek,
    ChannelType::Custom,
];

/// Bearer-authenticated OpenAI wire format, also spoken by DeepSeek and most self-hosted
/// servers.
#[derive(Debug, Default)]
pub struct OpenAiCompatAdapter;

impl OpenAiCompatAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn channel_types(&self) -> &'static [ChannelType] {
        CHANNEL_TYPES
    }

    async fn build_request(
        &self,
        _ctx: &UpstreamCtx,
        provider: &Provider,
        endpoint: Endpoint,
        body: JsonValue,
        is_stream: bool,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let channel = provider.channel();
        let base_url = match (channel.base_url.as_deref(), channel.channel_type) {
            (Some(base), _) if !base.trim().is_empty() => base,
            (_, ChannelType::Openai) => "https://api.openai.com",
            (_, ChannelType::Deepseek) => "https://api.deepseek.com",
            _ => {
                return Err(ProviderError::InvalidConfig(format!(
                    "channel {} has no base_url",
                    channel.id
                )));
            }
        };

        let mut headers = Vec::new();
        auth_headers::set_bearer(&mut headers, &channel.api_key);
        auth_headers::set_json_body(&mut headers, is_stream);

        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: build_url(base_url, endpoint.path()),
            headers,
            body: Some(prepare_body(provider, endpoint, body, is_stream)?),
            is_stream,
        })
    }
}

/// Joins `base` and `/v1{path}`, tolerating bases that already end in `/v1`.
pub(crate) fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}{path}")
    } else {
        format!("{base}/v1{path}")
    }
}

/// Applies send-time custom parameters and stream defaults, then serializes.
pub(crate) fn prepare_body(
    provider: &Provider,
    endpoint: Endpoint,
    mut body: JsonValue,
    is_stream: bool,
) -> ProviderResult<Bytes> {
    let Some(object) = body.as_object_mut() else {
        return Err(ProviderError::Encode("request body is not an object".to_string()));
    };

    // Pre-added parameters were merged before parsing already.
    if let Some(params) = provider.custom_parameters()?
        && !params.pre_add()
    {
        params.merge_into(object, provider.original_model());
    }

    // Streamed usage only arrives when asked for.
    if is_stream && endpoint != Endpoint::Embeddings && !object.contains_key("stream_options") {
        object.insert("stream_options".to_string(), json!({"include_usage": true}));
    }

    serde_json::to_vec(&body)
        .map(Bytes::from)
        .map_err(|err| ProviderError::Encode(err.to_string()))
}
