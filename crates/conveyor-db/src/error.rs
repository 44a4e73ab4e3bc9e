//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Entity not found.
    #[error("Entity not found")]
    NotFound,

    /// Status change the schema forbids.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Invalid data.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// SQLx error.
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
