//! Job-store connection pool and migrations.

use std::time::Duration;

use anyhow::{Context, Result};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::retry::RetryPolicy;

const CONNECT_RETRIES: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("job store unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: sea_orm::DbErr,
    },
    #[error("job store url is empty")]
    MissingUrl,
}

/// In-memory SQLite gives every connection its own database, so the pool is
/// pinned to one connection there.
fn connect_options(cfg: &AppConfig) -> ConnectOptions {
    let in_memory = cfg.database_url.starts_with("sqlite") && cfg.database_url.contains(":memory:");
    let max_connections = if in_memory { 1 } else { cfg.db_max_connections.max(1) };

    let mut opt = ConnectOptions::new(cfg.database_url.clone());
    opt.max_connections(max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    if !in_memory {
        opt.idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800));
    }
    opt
}

/// Opens the pool, retrying the first connect with doubling delays.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.trim().is_empty() {
        return Err(DatabaseError::MissingUrl.into());
    }

    let opt = connect_options(cfg);
    let policy = RetryPolicy {
        max_retries: CONNECT_RETRIES,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(2),
        jitter_factor: 0.0,
    };

    let mut retry = 0;
    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                info!(attempts = retry + 1, "Connected to job store");
                return Ok(conn);
            }
            Err(source) if retry >= policy.max_retries => {
                return Err(DatabaseError::Unreachable {
                    attempts: retry + 1,
                    source,
                }
                .into());
            }
            Err(err) => {
                retry += 1;
                let delay = policy.backoff(retry);
                warn!(retry, ?delay, error = %err, "Job store connect failed, retrying");
                sleep(delay).await;
            }
        }
    }
}

pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    Migrator::up(db, None)
        .await
        .context("applying database migrations")?;
    info!("Database migrations applied");
    Ok(())
}

/// Round-trips `SELECT 1` for the readiness endpoint.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .context("job store health check failed")?;
    Ok(())
}
