use std::sync::Arc;

use relayhub_provider_core::{AdapterRegistry, ApiError, ChannelFilter, ChannelGroup, Provider};

/// Picks a channel and binds it to its wire adapter.
#[derive(Clone)]
pub struct ProviderSelector {
    channels: Arc<ChannelGroup>,
    adapters: Arc<AdapterRegistry>,
}

impl ProviderSelector {
    pub fn new(channels: Arc<ChannelGroup>, adapters: Arc<AdapterRegistry>) -> Self {
        Self { channels, adapters }
    }

    pub fn channels(&self) -> &Arc<ChannelGroup> {
        &self.channels
    }

    pub async fn select(
        &self,
        group: &str,
        model: &str,
        filters: &[ChannelFilter],
    ) -> Result<Provider, ApiError> {
        let channel = self
            .channels
            .select(group, model, filters)
            .await
            .map_err(|err| ApiError::unavailable(err.to_string()))?;
        self.adapters
            .bind(channel, model)
            .map_err(|err| ApiError::unavailable(err.to_string()))
    }

    pub async fn count(&self, group: &str, model: &str, filters: &[ChannelFilter]) -> usize {
        self.channels.count_available(group, model, filters).await
    }
}
