use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ApiError;
use crate::channel::{ChannelId, ChannelStatus, ChannelType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Relay(RelayOutcomeEvent),
    Operational(OperationalEvent),
}

/// Terminal outcome of one inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayOutcomeEvent {
    pub trace_id: String,
    pub at: SystemTime,
    pub path: String,
    pub model: String,
    pub user_id: i64,
    pub attempts: u32,
    /// Channel of the last attempt.
    pub channel_id: Option<ChannelId>,
    pub status: u16,
    pub is_stream: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    CooldownStart(CooldownStartEvent),
    CooldownEnd(CooldownEndEvent),
    ChannelFailure(ChannelFailureEvent),
    ChannelStatus(ChannelStatusEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownStartEvent {
    pub at: SystemTime,
    pub channel_id: ChannelId,
    pub model: String,
    pub until: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEndEvent {
    pub at: SystemTime,
    pub channel_id: ChannelId,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFailureEvent {
    pub at: SystemTime,
    pub trace_id: Option<String>,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub channel_type: ChannelType,
    pub error: ApiError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatusEvent {
    pub at: SystemTime,
    pub channel_id: ChannelId,
    pub from: ChannelStatus,
    pub to: ChannelStatus,
}
