use alloy::primitives::U256;
use alloy::providers::ProviderBuilder;
use clap::Parser;
use eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::ServiceConfig;
use vault_sync::{AlloyChainProvider, LoggingEmailSender, MemoryStore, SyncPipeline};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration directory
    #[arg(long, default_value = "./configs/dev")]
    config_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Historical sync only (no live subscription)
    #[arg(long)]
    no_live: bool,

    /// Run one catch-up sync and exit
    #[arg(long)]
    once: bool,

    /// Re-read one vault from the contract, overwrite its balance and exit
    #[arg(long, value_name = "VAULT_ID")]
    resync_vault: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting vault syncer");

    // Load configuration
    let config_file = PathBuf::from(&cli.config_path).join("syncer.json");
    let mut config = if config_file.exists() {
        ServiceConfig::load_from_file(&config_file).await?.with_env_overrides()
    } else {
        tracing::warn!(path = %config_file.display(), "syncer.json not found, using defaults");
        ServiceConfig::default().with_env_overrides()
    };
    if cli.no_live {
        config.sync.live_enabled = false;
    }

    tracing::info!(
        rpc_url = %config.sync.rpc_url,
        contract = %config.sync.contract_address,
        deployment_block = config.sync.deployment_block,
        enabled = config.sync.enabled,
        live = config.sync.live_enabled,
        users = config.users.len(),
        "Config loaded"
    );

    let http = ProviderBuilder::new().connect_http(config.sync.rpc_url.parse()?);
    let chain = AlloyChainProvider::new(http, &config.sync.rpc_url, config.sync.ws_url.clone())
        .with_pong_timeout(Duration::from_secs(config.sync.pong_timeout_secs));
    match chain.ws_url() {
        Some(ws_url) => tracing::info!(ws_url, "Live events via WebSocket"),
        None => tracing::info!("No WebSocket endpoint, live events via polling"),
    }

    let store = Arc::new(MemoryStore::with_users(config.users.clone()));
    let pipeline = Arc::new(SyncPipeline::new(
        config.sync.clone(),
        Arc::new(chain),
        store,
        Arc::new(LoggingEmailSender),
    )?);

    if let Some(vault_id) = cli.resync_vault {
        let vault_id: U256 = vault_id.parse()?;
        pipeline.initialize().await?;
        let vault = pipeline.resync_vault(vault_id).await?;
        println!("{}", serde_json::to_string_pretty(&vault)?);
        pipeline.shutdown().await;
        return Ok(());
    }

    if cli.once {
        let outcome = pipeline.run_once().await?;
        tracing::info!(
            from_block = outcome.from_block,
            to_block = outcome.to_block,
            applied = outcome.events_applied,
            failed = outcome.events_failed,
            skipped = outcome.skipped.is_some(),
            "One-shot sync finished"
        );
        println!("{}", serde_json::to_string_pretty(&pipeline.status())?);
        pipeline.shutdown().await;
        return Ok(());
    }

    pipeline.start().await?;
    tracing::info!("Vault syncer running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    pipeline.shutdown().await;
    tracing::info!(status = %serde_json::to_string(&pipeline.status())?, "Final status");

    Ok(())
}
