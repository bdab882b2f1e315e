//! Database connection and pool management.
//!
//! Initializes a SeaORM pool (Postgres in production, SQLite for tests and
//! local runs) and applies the schema migrations.

use anyhow::{Context, Result};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;

/// Errors that can occur during database setup.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("Database connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Opens the pool described by `cfg`.
///
/// In-memory SQLite URLs are pinned to a single connection, since every
/// connection would otherwise open its own private database.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    let url = cfg.database_url.trim();
    if url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        }
        .into());
    }

    let max_connections = if is_memory_url(url) { 1 } else { cfg.db_max_connections };
    let mut opt = ConnectOptions::new(url);
    opt.max_connections(max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    connect_with_retry(opt, cfg.db_acquire_timeout_ms).await
}

/// Retries transient connect failures with doubling backoff.
async fn connect_with_retry(opt: ConnectOptions, timeout_ms: u64) -> Result<DatabaseConnection> {
    let mut delay = CONNECT_BACKOFF;
    let mut last_error = None;

    for attempt in 1..=CONNECT_ATTEMPTS {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                tracing::info!(attempt, "connected to database");
                return Ok(conn);
            }
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                tracing::warn!(attempt, error = %err, retry_in_ms = delay.as_millis() as u64, "database connect failed");
                sleep(delay).await;
                delay *= 2;
                last_error = Some(err);
            }
            Err(err) => {
                tracing::error!(attempts = CONNECT_ATTEMPTS, error = %err, "giving up on database connect");
                return Err(DatabaseError::ConnectionFailed { source: err }.into());
            }
        }
    }

    match last_error {
        Some(source) => Err(DatabaseError::ConnectionFailed { source }.into()),
        None => Err(DatabaseError::ConnectionTimeout { timeout_ms }.into()),
    }
}

/// Applies all pending schema migrations.
pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    Migrator::up(db, None)
        .await
        .context("Failed to apply database migrations")?;
    tracing::info!("database migrations applied");
    Ok(())
}

/// Verifies the connection is alive with `SELECT 1`.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());

    db.query_one(stmt)
        .await
        .context("Database health check failed")?;

    Ok(())
}

fn is_memory_url(url: &str) -> bool {
    url.starts_with("sqlite") && url.contains(":memory:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_database_url() {
        let config = AppConfig {
            database_url: "".to_string(),
            ..AppConfig::default()
        };

        let result = init_pool(&config).await;

        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err().downcast::<DatabaseError>(),
            Ok(DatabaseError::InvalidConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn memory_pool_migrates_and_is_healthy() {
        let config = AppConfig {
            database_url: "sqlite::memory:".to_string(),
            ..AppConfig::default()
        };

        let db = init_pool(&config).await.unwrap();
        run_migrations(&db).await.unwrap();
        health_check(&db).await.unwrap();
    }

    #[test]
    fn detects_memory_urls() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://:memory:"));
        assert!(!is_memory_url("sqlite://dirsync.db?mode=rwc"));
        assert!(!is_memory_url("postgresql://localhost/dirsync"));
    }
}
