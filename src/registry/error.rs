//! Typed errors for the registry store.

use thiserror::Error;

/// Failure modes of registry operations.
///
/// Unique-key and missing-row conditions are separated from plain query
/// failures so callers can suppress the idempotent cases without inspecting
/// message text.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db) = e.as_database_error() {
            if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
                return StoreError::UniqueViolation(db.message().to_string());
            }
        }
        StoreError::Query(e.to_string())
    }
}

impl StoreError {
    /// True for the one condition idempotent inserts are allowed to swallow.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}
