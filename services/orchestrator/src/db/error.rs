//! Database error types.

use thiserror::Error;

use crate::store::StoreError;

/// Database operation errors.
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
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/orchestrator.")]
    MigrationDirNotFound { tried: String, last_error: String },
}

/// Maps query failures onto the store taxonomy, surfacing unique-index
/// violations as conflicts.
pub(crate) fn query_error(err: sqlx::Error, conflict: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::Conflict(conflict.to_string());
        }
    }
    StoreError::Backend(DbError::Query(err).to_string())
}
