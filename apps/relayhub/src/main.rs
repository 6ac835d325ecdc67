use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use relayhub_core::bootstrap_from_env;
use relayhub_router::app_router;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("relayhub failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let boot = Arc::new(bootstrap_from_env().await?);
    let channels = boot.engine.channels().snapshot().await;
    info!(
        host = %boot.config.host,
        port = boot.config.port,
        proxy = %boot.config.proxy.as_deref().unwrap_or(""),
        retry_times = boot.config.retry_times,
        retry_timeout_secs = boot.config.retry_timeout_secs,
        retry_cooldown_secs = boot.config.retry_cooldown_secs,
        channels = channels.len(),
        "config loaded"
    );

    let app = app_router(boot.engine.clone(), boot.auth.clone());
    let bind = format!("{}:{}", boot.config.host, boot.config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %bind, "listening");

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(boot.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("serve")?;
    Ok(())
}

/// `kill -HUP` re-reads the bootstrap file. Bind address changes need a restart.
#[cfg(unix)]
async fn reload_on_hangup(boot: Arc<relayhub_core::Bootstrap>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "SIGHUP handler unavailable");
            return;
        }
    };
    while hangups.recv().await.is_some() {
        match boot.reload().await {
            Ok(summary) => info!(
                channels = summary.channels,
                removed = summary.removed,
                tokens = summary.tokens,
                new_balances = summary.new_balances,
                "bootstrap reloaded"
            ),
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "bootstrap reload failed"),
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relayhub=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
