use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{Channel, ChannelType};
use crate::errors::{ProviderError, ProviderResult};
use crate::provider::{Provider, ProviderAdapter};

/// Channel type -> wire adapter.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ChannelType, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        for channel_type in adapter.channel_types() {
            self.adapters.insert(*channel_type, adapter.clone());
        }
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&channel_type).cloned()
    }

    /// Binds `channel` to `model` with the adapter registered for its type.
    pub fn bind(&self, channel: Arc<Channel>, model: &str) -> ProviderResult<Provider> {
        let adapter = self
            .get(channel.channel_type)
            .ok_or_else(|| ProviderError::NoAdapter(channel.channel_type.to_string()))?;
        Ok(Provider::new(channel, model, adapter))
    }
}
