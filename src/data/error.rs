//! Unified error type for the storage layer
//!
//! Errors are classified so callers can apply the right policy: duplicate
//! sample conflicts are silently ignored, transient IO is logged and the
//! sample dropped, invariant and input errors surface to the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("migration {version} ({name}) failed: {error}")]
    MigrationFailed {
        version: i32,
        name: String,
        error: String,
    },

    /// Duplicate `(identity, ts)` insert. Non-fatal by design.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown rule id and friends; no state was mutated.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected at the mutation boundary (empty identity field, negative
    /// delay, missing threshold).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl DataError {
    pub fn migration_failed(version: i32, name: &str, error: impl ToString) -> Self {
        Self::MigrationFailed {
            version,
            name: name.to_string(),
            error: error.to_string(),
        }
    }

    /// Unique-constraint violation on insert (Postgres SQLSTATE 23505).
    pub fn is_unique_violation(e: &sqlx::Error) -> bool {
        matches!(
            e,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
        )
    }

    /// Connection-level errors that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_failed_display() {
        let err = DataError::migration_failed(3, "alarm_tables", "syntax error");
        assert_eq!(
            err.to_string(),
            "migration 3 (alarm_tables) failed: syntax error"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(DataError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!DataError::Config("bad".into()).is_transient());
        assert!(!DataError::Conflict("dup".into()).is_transient());
    }
}
