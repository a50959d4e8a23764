use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A lookup matched no row.
    #[error("record not found")]
    NotFound,

    /// Optimistic version check failed; the caller should reload and retry.
    #[error("edit conflict")]
    Conflict,

    /// Unique index on `users.email` rejected the write.
    #[error("duplicate email")]
    DuplicateEmail,

    /// The backend refused the write (foreign key, check constraint...).
    /// Retrying will not help.
    #[error("write rejected: {0}")]
    Rejected(rusqlite::Error),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// I/O or locking hiccup in the backend. Worth retrying.
    #[error("database error: {0}")]
    Transient(rusqlite::Error),

    #[error("database lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        let constraint = matches!(
            &e,
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
        );
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            e if constraint => StoreError::Rejected(e),
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(e.to_string()),
            e => StoreError::Transient(e),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_backend_errors() {
        assert!(matches!(
            StoreError::from(rusqlite::Error::QueryReturnedNoRows),
            StoreError::NotFound
        ));

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::from(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY),
            Some("FOREIGN KEY constraint failed".into()),
        );
        let err = StoreError::from(constraint);
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(!err.is_transient());
    }
}
