//! Database connection pool for credentials, accounts and sync history.

use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AppConfig;

const CONNECT_ATTEMPTS: u32 = 5;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: DbErr,
    },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("Database health check failed: {0}")]
    HealthCheck(#[from] DbErr),
}

/// Open the pool described by `cfg`, retrying transient connect failures with
/// doubling delays.
///
/// ```no_run
/// use ads_connect::{config::AppConfig, db::init_pool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let db = init_pool(&AppConfig::default()).await?;
///     ads_connect::db::health_check(&db).await?;
///     Ok(())
/// }
/// ```
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection, DatabaseError> {
    if cfg.database_url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        });
    }

    let mut opt = ConnectOptions::new(&cfg.database_url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let mut retry_delay = Duration::from_millis(100);
    let mut attempt = 1;
    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                info!(attempt, "Connected to database");
                return Ok(conn);
            }
            Err(e) if attempt >= CONNECT_ATTEMPTS => {
                error!(attempts = attempt, error = %e, "Giving up connecting to database");
                return Err(DatabaseError::ConnectionFailed {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                warn!(attempt, error = %e, delay_ms = retry_delay.as_millis() as u64, "Database connection failed, retrying");
                sleep(retry_delay).await;
                retry_delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// Verify the connection answers a trivial query.
pub async fn health_check(db: &DatabaseConnection) -> Result<(), DatabaseError> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_database_url_is_rejected() {
        let config = AppConfig {
            database_url: String::new(),
            ..AppConfig::default()
        };

        let result = init_pool(&config).await;

        assert!(matches!(
            result,
            Err(DatabaseError::InvalidConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn test_health_check_on_sqlite() {
        let db = Database::connect("sqlite::memory:").await.unwrap();

        assert!(health_check(&db).await.is_ok());
    }
}
