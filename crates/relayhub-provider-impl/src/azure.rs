use serde_json::Value as JsonValue;

use relayhub_provider_core::{
    ChannelType, Endpoint, HttpMethod, Provider, ProviderAdapter, ProviderError, ProviderResult,
    UpstreamCtx, UpstreamHttpRequest, header_set,
};

use crate::auth_headers;
use crate::openai::prepare_body;

const ADAPTER_NAME: &str = "azure";
const DEFAULT_API_VERSION: &str = "2024-10-21";

/// Azure OpenAI: deployment-scoped URLs and an `api-key` header.
#[derive(Debug, Default)]
pub struct AzureAdapter;

impl AzureAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AzureAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    fn channel_types(&self) -> &'static [ChannelType] {
        &[ChannelType::Azure]
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
        let base_url = channel
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidConfig(format!("azure channel {} has no base_url", channel.id))
            })?
            .trim_end_matches('/');
        let api_version = channel
            .api_version
            .as_deref()
            .filter(|version| !version.is_empty())
            .unwrap_or(DEFAULT_API_VERSION);
        // Deployment names cannot contain dots.
        let deployment = provider.model().replace('.', "");

        let mut headers = Vec::new();
        header_set(&mut headers, "api-key", channel.api_key.clone());
        auth_headers::set_json_body(&mut headers, is_stream);

        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!(
                "{base_url}/openai/deployments/{deployment}{}?api-version={api_version}",
                endpoint.path()
            ),
            headers,
            body: Some(prepare_body(provider, endpoint, body, is_stream)?),
            is_stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use relayhub_provider_core::{Channel, ChannelStatus, header_get};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn deployment_url_and_key_header() {
        let channel = Channel {
            id: 3,
            name: "az".to_string(),
            channel_type: ChannelType::Azure,
            status: ChannelStatus::Enabled,
            groups: vec!["default".to_string()],
            models: vec!["gpt-3.5-turbo".to_string()],
            priority: 0,
            weight: 1,
            base_url: Some("https://res.openai.azure.com/".to_string()),
            api_key: "az-key".to_string(),
            custom_parameter: None,
            model_mapping: HashMap::new(),
            api_version: None,
        };
        let provider = Provider::new(Arc::new(channel), "gpt-3.5-turbo", Arc::new(AzureAdapter));
        let req = provider
            .build_request(
                &UpstreamCtx::default(),
                Endpoint::ChatCompletions,
                json!({"model": "gpt-3.5-turbo", "messages": []}),
                false,
            )
            .await
            .unwrap();
        assert_eq!(
            req.url,
            "https://res.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-10-21"
        );
        assert_eq!(header_get(&req.headers, "api-key"), Some("az-key"));
        assert!(header_get(&req.headers, "authorization").is_none());
    }
}
