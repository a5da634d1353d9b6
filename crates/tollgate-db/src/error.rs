//! Database error types

use thiserror::Error;

/// Database operation errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A write was attempted on a read-only (replica) transaction
    #[error("Read-only transaction: {0}")]
    ReadOnly(&'static str),

    /// No database node could serve the request
    #[error("Database unavailable: {0}")]
    Unavailable(String),
}

impl DbError {
    /// Translate unique and foreign key violations into typed errors.
    pub(crate) fn from_query(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return DbError::Duplicate(format!(
                    "{} ({})",
                    what,
                    db_err.constraint().unwrap_or("unique")
                ));
            }
            if db_err.is_foreign_key_violation() {
                return DbError::Constraint(format!(
                    "{} ({})",
                    what,
                    db_err.constraint().unwrap_or("foreign key")
                ));
            }
        }
        DbError::Query(err)
    }
}

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;
