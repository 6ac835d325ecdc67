use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config field {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Final, merged relay configuration used by the running process.
///
/// Merge order: CLI > ENV > bootstrap file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Additional attempts after the first one.
    pub retry_times: u32,
    /// Wall-clock budget for the whole retry loop, in seconds.
    pub retry_timeout_secs: u64,
    /// Cooldown applied to a (channel, model) pair after a 429. Zero disables cooldowns.
    pub retry_cooldown_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Mark channels auto-disabled when they fail with credential-class errors.
    pub auto_disable_channel: bool,
    pub server_address: String,
    pub payment_callback_address: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            proxy: None,
            retry_times: 0,
            retry_timeout_secs: 120,
            retry_cooldown_secs: 60,
            heartbeat_interval_secs: 15,
            auto_disable_channel: true,
            server_address: "http://localhost:8787".to_string(),
            payment_callback_address: None,
        }
    }
}

impl RelayConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Optional layer used for merging relay config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub retry_times: Option<u32>,
    pub retry_timeout_secs: Option<u64>,
    pub retry_cooldown_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub auto_disable_channel: Option<bool>,
    pub server_address: Option<String>,
    pub payment_callback_address: Option<String>,
}

impl RelayConfigPatch {
    pub fn overlay(&mut self, other: RelayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.retry_times.is_some() {
            self.retry_times = other.retry_times;
        }
        if other.retry_timeout_secs.is_some() {
            self.retry_timeout_secs = other.retry_timeout_secs;
        }
        if other.retry_cooldown_secs.is_some() {
            self.retry_cooldown_secs = other.retry_cooldown_secs;
        }
        if other.heartbeat_interval_secs.is_some() {
            self.heartbeat_interval_secs = other.heartbeat_interval_secs;
        }
        if other.auto_disable_channel.is_some() {
            self.auto_disable_channel = other.auto_disable_channel;
        }
        if other.server_address.is_some() {
            self.server_address = other.server_address;
        }
        if other.payment_callback_address.is_some() {
            self.payment_callback_address = other.payment_callback_address;
        }
    }

    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let defaults = RelayConfig::default();
        let heartbeat_interval_secs = self
            .heartbeat_interval_secs
            .unwrap_or(defaults.heartbeat_interval_secs);
        if heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_secs",
                reason: "must be greater than zero",
            });
        }
        Ok(RelayConfig {
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            proxy: self
                .proxy
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            retry_times: self.retry_times.unwrap_or(defaults.retry_times),
            retry_timeout_secs: self
                .retry_timeout_secs
                .unwrap_or(defaults.retry_timeout_secs),
            retry_cooldown_secs: self
                .retry_cooldown_secs
                .unwrap_or(defaults.retry_cooldown_secs),
            heartbeat_interval_secs,
            auto_disable_channel: self
                .auto_disable_channel
                .unwrap_or(defaults.auto_disable_channel),
            server_address: self.server_address.unwrap_or(defaults.server_address),
            payment_callback_address: self.payment_callback_address,
        })
    }
}

impl From<RelayConfig> for RelayConfigPatch {
    fn from(value: RelayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            proxy: value.proxy,
            retry_times: Some(value.retry_times),
            retry_timeout_secs: Some(value.retry_timeout_secs),
            retry_cooldown_secs: Some(value.retry_cooldown_secs),
            heartbeat_interval_secs: Some(value.heartbeat_interval_secs),
            auto_disable_channel: Some(value.auto_disable_channel),
            server_address: Some(value.server_address),
            payment_callback_address: value.payment_callback_address,
        }
    }
}
