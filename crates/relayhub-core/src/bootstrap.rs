use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use relayhub_common::{RelayConfig, RelayConfigPatch};
use relayhub_provider_core::{Channel, ChannelGroup, EventHub, TerminalEventSink};
use relayhub_provider_impl::builtin_registry;

use crate::auth::{AuthSnapshot, MemoryAuth, TokenEntry};
use crate::engine::RelayEngine;
use crate::quota::{MemoryLedger, PriceTable, QuotaManager};
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "relayhub",
    version,
    about = "Multi-channel relay for OpenAI-compatible APIs"
)]
pub struct CliArgs {
    /// Bootstrap JSON file (config patch, channels, tokens, prices, balances).
    #[arg(long, env = "RELAYHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind host.
    #[arg(long, env = "RELAYHUB_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "RELAYHUB_PORT")]
    pub port: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "RELAYHUB_PROXY")]
    pub proxy: Option<String>,

    /// Extra attempts on other channels after a retryable failure.
    #[arg(long, env = "RELAYHUB_RETRY_TIMES")]
    pub retry_times: Option<String>,

    /// Wall-clock limit for the retry loop, in seconds.
    #[arg(long, env = "RELAYHUB_RETRY_TIMEOUT")]
    pub retry_timeout: Option<String>,

    /// Cooldown after a 429, in seconds. 0 disables cooldowns.
    #[arg(long, env = "RELAYHUB_RETRY_COOLDOWN_SECONDS")]
    pub retry_cooldown: Option<String>,

    #[arg(long, env = "RELAYHUB_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: Option<String>,

    #[arg(long, env = "RELAYHUB_AUTO_DISABLE_CHANNEL")]
    pub auto_disable_channel: Option<String>,

    #[arg(long, env = "RELAYHUB_SERVER_ADDRESS")]
    pub server_address: Option<String>,

    #[arg(long, env = "RELAYHUB_PAYMENT_CALLBACK_ADDRESS")]
    pub payment_callback_address: Option<String>,
}

/// On-disk bootstrap document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BootstrapFile {
    pub config: RelayConfigPatch,
    pub channels: Vec<Channel>,
    pub tokens: Vec<TokenEntry>,
    pub prices: PriceTable,
    /// User id -> starting quota.
    pub balances: HashMap<i64, i64>,
}

pub struct Bootstrap {
    /// Config as loaded at startup. The live copy is `engine.config()`.
    pub config: RelayConfig,
    pub args: CliArgs,
    pub engine: Arc<RelayEngine>,
    pub auth: Arc<MemoryAuth>,
    pub ledger: Arc<MemoryLedger>,
    /// Kept so a config reload can swap the egress proxy.
    pub upstream: Arc<WreqUpstreamClient>,
    pub events: EventHub,
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub channels: usize,
    pub removed: usize,
    pub tokens: usize,
    pub new_balances: usize,
}

impl Bootstrap {
    /// Re-reads the bootstrap file and swaps config, tokens, prices and channels in place.
    /// Existing balances are kept; only users the ledger has never seen are seeded.
    pub async fn reload(&self) -> anyhow::Result<ReloadSummary> {
        let Some(path) = self.args.config.as_deref() else {
            anyhow::bail!("no bootstrap file configured");
        };
        let file = load_file(path)?;
        let config = merge_config(file.config, &self.args)?;
        self.engine.replace_config(config);

        let tokens = file.tokens.len();
        self.auth.replace_snapshot(AuthSnapshot::from_entries(file.tokens));
        self.engine.quotas().set_prices(file.prices);

        let channels = self.engine.channels();
        let keep: HashSet<_> = file.channels.iter().map(|channel| channel.id).collect();
        let mut removed = 0;
        for view in channels.snapshot().await {
            if !keep.contains(&view.channel.id) {
                channels.remove(view.channel.id).await;
                removed += 1;
            }
        }
        let total = file.channels.len();
        for channel in file.channels {
            channels.insert(channel).await;
        }

        let mut new_balances = 0;
        for (user_id, quota) in file.balances {
            if self.ledger.balance(user_id).is_none() {
                self.ledger.set_balance(user_id, quota);
                new_balances += 1;
            }
        }

        Ok(ReloadSummary {
            channels: total,
            removed,
            tokens,
            new_balances,
        })
    }
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let file = match args.config.as_deref() {
        Some(path) => load_file(path)?,
        None => BootstrapFile::default(),
    };

    let config = merge_config(file.config, &args)?;

    let events = EventHub::new(1024);
    events.add_sink(Arc::new(TerminalEventSink::new())).await;

    let channels = Arc::new(ChannelGroup::new(events.clone(), config.retry_cooldown()));
    for channel in file.channels {
        channels.insert(channel).await;
    }

    let ledger = Arc::new(MemoryLedger::new());
    for (user_id, quota) in file.balances {
        ledger.set_balance(user_id, quota);
    }
    let quotas = QuotaManager::new(ledger.clone(), file.prices);

    let upstream = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::from_config(&config))
            .context("build upstream client")?,
    );

    let engine = RelayEngine::new(
        config.clone(),
        channels,
        Arc::new(builtin_registry()),
        upstream.clone(),
        quotas,
    );

    Ok(Bootstrap {
        config,
        args,
        engine: Arc::new(engine),
        auth: Arc::new(MemoryAuth::new(AuthSnapshot::from_entries(file.tokens))),
        ledger,
        upstream,
        events,
    })
}

// clap already resolves CLI > ENV per field; both then overlay the file.
fn merge_config(file: RelayConfigPatch, args: &CliArgs) -> anyhow::Result<RelayConfig> {
    let mut merged = file;
    merged.overlay(cli_patch(args)?);
    merged
        .into_config()
        .context("finalize merged relay config")
}

pub fn load_file(path: &Path) -> anyhow::Result<BootstrapFile> {
    let raw = std::fs::read(path)
        .with_context(|| format!("read bootstrap file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("parse bootstrap file {}", path.display()))
}

fn cli_patch(args: &CliArgs) -> anyhow::Result<RelayConfigPatch> {
    Ok(RelayConfigPatch {
        host: sanitize_optional_env_value(args.host.clone()),
        port: parse_env_value(args.port.clone(), "RELAYHUB_PORT")?,
        proxy: sanitize_optional_env_value(args.proxy.clone()),
        retry_times: parse_env_value(args.retry_times.clone(), "RELAYHUB_RETRY_TIMES")?,
        retry_timeout_secs: parse_env_value(args.retry_timeout.clone(), "RELAYHUB_RETRY_TIMEOUT")?,
        retry_cooldown_secs: parse_env_value(
            args.retry_cooldown.clone(),
            "RELAYHUB_RETRY_COOLDOWN_SECONDS",
        )?,
        heartbeat_interval_secs: parse_env_value(
            args.heartbeat_interval.clone(),
            "RELAYHUB_HEARTBEAT_INTERVAL",
        )?,
        auto_disable_channel: parse_bool_env_value(
            args.auto_disable_channel.clone(),
            "RELAYHUB_AUTO_DISABLE_CHANNEL",
        )?,
        server_address: sanitize_optional_env_value(args.server_address.clone()),
        payment_callback_address: sanitize_optional_env_value(
            args.payment_callback_address.clone(),
        ),
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Unresolved `${VAR}` placeholders count as unset.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_env_value<T>(value: Option<String>, env_name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<T>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_are_sanitized_and_parsed() {
        let args = CliArgs {
            port: Some(" 9000 ".to_string()),
            proxy: Some("${RELAYHUB_PROXY}".to_string()),
            retry_times: Some("3".to_string()),
            auto_disable_channel: Some("off".to_string()),
            ..CliArgs::default()
        };
        let patch = cli_patch(&args).unwrap();
        assert_eq!(patch.port, Some(9000));
        assert_eq!(patch.proxy, None);
        assert_eq!(patch.retry_times, Some(3));
        assert_eq!(patch.auto_disable_channel, Some(false));
    }

    #[test]
    fn bad_numbers_name_the_variable() {
        let args = CliArgs {
            retry_timeout: Some("soon".to_string()),
            ..CliArgs::default()
        };
        let err = cli_patch(&args).unwrap_err();
        assert!(err.to_string().contains("RELAYHUB_RETRY_TIMEOUT"));
    }

    #[test]
    fn bootstrap_file_parses_with_defaults() {
        let raw = r#"{
            "config": {"retry_times": 2},
            "channels": [{"id": 1, "name": "a", "type": "openai", "models": ["gpt-4o"], "api_key": "sk"}],
            "tokens": [{"id": 1, "key": "sk-user", "user_id": 7}],
            "balances": {"7": 1000}
        }"#;
        let file: BootstrapFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.config.retry_times, Some(2));
        assert_eq!(file.channels[0].groups, vec!["default".to_string()]);
        assert_eq!(file.tokens[0].group, "default");
        assert_eq!(file.balances.get(&7), Some(&1000));
    }

    fn write_bootstrap(path: &Path, raw: &str) {
        std::fs::write(path, raw).unwrap();
    }

    fn keyed(key: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", key.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn reload_swaps_state_and_keeps_balances() {
        let path = std::env::temp_dir().join(format!(
            "relayhub-reload-{}-{}.json",
            std::process::id(),
            line!()
        ));
        write_bootstrap(
            &path,
            r#"{
                "config": {"retry_times": 1},
                "channels": [
                    {"id": 1, "name": "a", "type": "openai", "models": ["m"], "api_key": "sk"},
                    {"id": 2, "name": "b", "type": "openai", "models": ["m"], "api_key": "sk"}
                ],
                "tokens": [{"id": 1, "key": "sk-a", "user_id": 7}],
                "balances": {"7": 100}
            }"#,
        );
        let boot = bootstrap(CliArgs {
            config: Some(path.clone()),
            ..CliArgs::default()
        })
        .await
        .unwrap();
        assert_eq!(boot.engine.config().retry_times, 1);
        assert!(boot.auth.authenticate(&keyed("sk-a")).is_ok());

        write_bootstrap(
            &path,
            r#"{
                "config": {"retry_times": 3, "proxy": "http://127.0.0.1:7890"},
                "channels": [
                    {"id": 2, "name": "b", "type": "openai", "models": ["m"], "api_key": "sk"},
                    {"id": 3, "name": "c", "type": "openai", "models": ["m"], "api_key": "sk"}
                ],
                "tokens": [{"id": 2, "key": "sk-b", "user_id": 8}],
                "balances": {"7": 5, "8": 50}
            }"#,
        );
        let summary = boot.reload().await.unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(
            summary,
            ReloadSummary {
                channels: 2,
                removed: 1,
                tokens: 1,
                new_balances: 1,
            }
        );
        assert_eq!(boot.engine.config().retry_times, 3);
        assert_eq!(boot.upstream.proxy().as_deref(), Some("http://127.0.0.1:7890"));

        let mut ids: Vec<_> = boot
            .engine
            .channels()
            .snapshot()
            .await
            .into_iter()
            .map(|view| view.channel.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3]);

        assert!(boot.auth.authenticate(&keyed("sk-a")).is_err());
        assert!(boot.auth.authenticate(&keyed("sk-b")).is_ok());
        assert_eq!(boot.ledger.balance(7), Some(100));
        assert_eq!(boot.ledger.balance(8), Some(50));
    }

    #[tokio::test]
    async fn reload_without_a_file_is_an_error() {
        let boot = bootstrap(CliArgs::default()).await.unwrap();
        assert!(boot.reload().await.is_err());
    }
}
