//! Database errors

use thiserror::Error;

/// Database errors
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration failure
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Record not found
    #[error("record not found")]
    NotFound,

    /// A unique constraint rejected the write
    #[error("unique constraint violated")]
    Conflict,
}

impl DbError {
    /// Map a write error, surfacing unique violations as [`DbError::Conflict`]
    pub(crate) fn from_write(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict,
            _ => Self::Sqlx(err),
        }
    }
}

/// Result alias for repository calls
pub type DbResult<T> = Result<T, DbError>;

/// A row that cannot be mapped onto its domain type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {table} row {id}: {reason}")]
pub struct InvalidRow {
    pub table: &'static str,
    pub id: String,
    pub reason: String,
}
