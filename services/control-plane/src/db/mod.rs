//! Postgres persistence for the control plane.
//!
//! [`Database`] owns the connection pool and migrations. [`PgStore`]
//! implements the store traits in [`crate::store`] on top of it with runtime
//! queries; each trait lives in its own submodule.

mod deployments;
mod error;
mod hierarchy;
mod nodes;
mod ports;
mod rows;
mod tasks;

pub use error::DbError;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/berth".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_connections);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..defaults
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Run pending migrations, loaded from disk at runtime.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/control-plane/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(DbError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// A store handle sharing this pool.
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// Postgres implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.database_url, "postgres://localhost/berth");
    }
}
