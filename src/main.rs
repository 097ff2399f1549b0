//! # Group Membership Sync Entry Point
//!
//! `serve` runs the API with the scheduler, session sweeper and backup loops.
//! The other commands run one pass and exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use groupsync::{
    config::ConfigLoader,
    db,
    server::{Services, build_services, run_server},
    telemetry,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "groupsync", version, about = "Group membership sync service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the API and run background loops (default)
    Serve,
    /// Re-time the enabled job backlog once
    Distribute {
        /// Reset every start date, not only stale ones
        #[arg(long)]
        force_all: bool,
    },
    /// Take one backup and apply retention
    Backup,
    /// Apply pending database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config, db).await,
        Command::Migrate => Ok(()),
        Command::Distribute { force_all } => {
            let Services { scheduler, .. } = build_services(Arc::new(config), Arc::new(db))?;
            let summary = scheduler
                .run_distribution_pass(Utc::now(), force_all)
                .await
                .context("distributing job start times")?;
            info!(
                updated = summary.updated.len(),
                conflicts = summary.conflicts.len(),
                "Distribution finished"
            );
            Ok(())
        }
        Command::Backup => {
            let Services { backup, .. } = build_services(Arc::new(config), Arc::new(db))?;
            let reports = backup.run(Utc::now()).await.context("running backup")?;
            for report in reports {
                info!(
                    source = %report.source_table,
                    backup = %report.backup_name,
                    rows = report.row_count,
                    deleted = report.deleted.len(),
                    "Backup finished"
                );
            }
            Ok(())
        }
    }
}
