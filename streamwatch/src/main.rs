use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use streamwatch::config::AppConfig;
use streamwatch::credentials::{CredentialManager, TwitchTokenExchange};
use streamwatch::logging;
use streamwatch::monitor::{
    HelixStatusApi, MonitorLoop, RateLimiter, RateLimiterConfig, StatusClient, StatusClientConfig,
};
use streamwatch::notification::build_sink;
use streamwatch::registry::{RegistryLimits, WatchStore, open_registry};
use streamwatch::utils::http_client::build_client;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long, env = "STREAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single cycle, print its outcome as JSON and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config =
        AppConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    let _log_guard = logging::init_logging(&config.logging)?;
    debug!(config = ?config, "Loaded configuration");

    let cancel = CancellationToken::new();
    let retention = logging::start_retention_cleanup(
        config.logging.log_dir.clone(),
        config.logging.retention_days,
        cancel.clone(),
    );

    let client = build_client(config.monitor.request_timeout)?;
    let exchange = Arc::new(TwitchTokenExchange::new(client.clone(), &config.twitch));
    let credentials = Arc::new(CredentialManager::new(
        exchange,
        config.monitor.token_refresh_margin,
    ));
    let api = Arc::new(HelixStatusApi::new(client, credentials, &config.twitch));
    let limiter = RateLimiter::new(RateLimiterConfig::per_minute(
        config.monitor.requests_per_minute,
    )?);
    let status_client = StatusClient::new(api, StatusClientConfig::from(&config.monitor))
        .with_rate_limiter(limiter);

    let registry = Arc::new(open_registry(&config.storage, RegistryLimits::default()).await);
    let stats = registry.stats().await?;
    info!(
        backend = registry.kind(),
        communities = stats.communities,
        entities = stats.entities,
        "Watch registry ready"
    );

    let sink = build_sink(&config.notification)?;
    info!(sink = sink.sink_type(), "Notification sink ready");

    let mut monitor = MonitorLoop::new(registry, status_client, sink, config.monitor.clone());

    if args.once {
        let outcome = monitor.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            shutdown.cancel();
        });

        monitor.run(cancel.clone()).await;
    }

    cancel.cancel();
    let _ = retention.await;
    info!("streamwatch stopped");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
