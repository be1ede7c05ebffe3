//! # ads-connect entry point
//!
//! `serve` (the default) runs the HTTP API together with the credential
//! refresh loop and the optional periodic sync. `migrate` applies pending
//! database migrations and exits.

use std::sync::Arc;

use ads_connect::{
    ads_api::HttpAdsApi,
    config::{AppConfig, ConfigLoader},
    crypto::CryptoKey,
    db,
    server::{Services, run_server},
    telemetry,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "ads-connect", version, about = "Amazon Ads credential and account sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the API server and background workers
    Serve,
    /// Apply pending database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    telemetry::describe_metrics();

    match config.redacted_json() {
        Ok(redacted) => tracing::info!(config = %redacted, "Loaded configuration"),
        Err(e) => tracing::warn!(error = %e, "Could not render redacted configuration"),
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => migrate(&config).await,
    }
}

async fn migrate(config: &AppConfig) -> Result<()> {
    let db = db::init_pool(config)
        .await
        .context("initializing database connection pool")?;
    Migrator::up(&db, None).await.context("applying migrations")?;
    tracing::info!("Migrations applied");
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let key_bytes = config
        .crypto_key
        .clone()
        .context("crypto key not present in configuration")?;
    let crypto_key = CryptoKey::new(key_bytes).context("initializing crypto key")?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    Migrator::up(&db, None).await.context("applying migrations")?;

    let api = Arc::new(HttpAdsApi::from_config(&config.amazon_ads));
    let services = Services::build(Arc::new(config), Arc::new(db), crypto_key, api);

    let shutdown = CancellationToken::new();

    let refresher = services.refresher.clone();
    let refresher_shutdown = shutdown.child_token();
    let refresh_task = tokio::spawn(async move { refresher.run(refresher_shutdown).await });

    let orchestrator = services.state.orchestrator.clone();
    let periodic = orchestrator.clone();
    let periodic_shutdown = shutdown.child_token();
    let periodic_task = tokio::spawn(async move { periodic.run_periodic(periodic_shutdown).await });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                signal_shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let served = run_server(services.state, shutdown.clone()).await;
    shutdown.cancel();

    let (refreshed, periodic, ()) =
        tokio::join!(refresh_task, periodic_task, orchestrator.shutdown());
    for (task, joined) in [("credential refresh", refreshed), ("periodic sync", periodic)] {
        if let Err(e) = joined {
            tracing::error!(task, error = %e, "Background task did not shut down cleanly");
        }
    }
    served.map_err(|e| anyhow!("server error: {}", e))
}
