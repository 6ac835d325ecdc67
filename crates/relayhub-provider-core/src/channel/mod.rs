mod cooldown_queue;
mod filter;
mod group;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use filter::ChannelFilter;
pub use group::{ChannelGroup, ChannelView, SelectError};

pub type ChannelId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Openai,
    Azure,
    Deepseek,
    Custom,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Openai => "openai",
            ChannelType::Azure => "azure",
            ChannelType::Deepseek => "deepseek",
            ChannelType::Custom => "custom",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    /// Set by the failure reporter; cleared only by an operator.
    AutoDisabled,
}

/// One configured upstream endpoint/credential pair.
///
/// Shared as `Arc<Channel>` and never mutated once inserted; operational status lives in
/// the [`ChannelGroup`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    pub models: Vec<String>,
    /// Higher tiers are tried first.
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Raw JSON object with per-channel request parameters.
    #[serde(default)]
    pub custom_parameter: Option<String>,
    /// Requested model name -> upstream model name.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_weight() -> u32 {
    1
}

impl Channel {
    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }

    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .filter(|mapped| !mapped.is_empty())
            .unwrap_or(model)
    }
}
