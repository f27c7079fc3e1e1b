//! Database error types.

use thiserror::Error;

/// Persistence errors, shared by the Postgres and in-memory stores.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/control-plane.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A stored row holds a value the domain types reject.
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub fn corrupt(table: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            table,
            reason: reason.to_string(),
        }
    }
}
