use super::{Channel, ChannelId, ChannelType};

/// Extra predicates applied on top of group/model/status/cooldown eligibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFilter {
    Exclude(Vec<ChannelId>),
    /// Pin the request to one channel.
    Only(ChannelId),
    Types(Vec<ChannelType>),
}

impl ChannelFilter {
    pub fn allows(&self, channel: &Channel) -> bool {
        match self {
            ChannelFilter::Exclude(ids) => !ids.contains(&channel.id),
            ChannelFilter::Only(id) => channel.id == *id,
            ChannelFilter::Types(types) => types.contains(&channel.channel_type),
        }
    }
}
