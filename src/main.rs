//! # Directory Sync Entry Point

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dirsync::{config::ConfigLoader, db, server, telemetry};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dirsync", version, about = "Directory reconciliation and synchronization engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the management API (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Requeue resumable interrupted tasks, pause the rest, and exit
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    telemetry::init_tracing(&config).context("failed to initialize tracing")?;

    if let Ok(redacted) = config.redacted_json() {
        info!(profile = %config.profile, config = %redacted, "configuration loaded");
    }

    let pool = db::init_pool(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Command::Recover => {
            if config.run_migrations {
                db::run_migrations(&pool).await?;
            }
            let state = server::AppState::build(Arc::new(config), pool)?;
            // Started tasks would die with this process, so they are only requeued here.
            let report = state
                .manager
                .recover_interrupted(false)
                .await
                .map_err(|err| anyhow::anyhow!("recovery failed: {err}"))?;
            info!(
                resumed = ?report.resumed,
                paused = ?report.paused,
                "recovery finished"
            );
        }
        Command::Serve => {
            if config.run_migrations {
                db::run_migrations(&pool).await?;
            }
            server::run_server(config, pool).await?;
        }
    }
    Ok(())
}
