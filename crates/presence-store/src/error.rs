use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Lock contention that may clear on a second attempt.
    pub fn is_transient(&self) -> bool {
        let sqlite = match self {
            StoreError::Sqlite(e) => e,
            StoreError::Connection(tokio_rusqlite::Error::Rusqlite(e)) => e,
            _ => return false,
        };
        matches!(
            sqlite.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_and_locked_are_transient() {
        assert!(StoreError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)).is_transient());
        assert!(StoreError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED)).is_transient());
        assert!(StoreError::Connection(tokio_rusqlite::Error::Rusqlite(sqlite_failure(
            rusqlite::ffi::SQLITE_BUSY
        )))
        .is_transient());
    }

    #[test]
    fn test_other_errors_are_not_transient() {
        assert!(!StoreError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT)).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::DuplicateIdentity("a@x.com".into()).is_transient());
        assert!(!StoreError::Connection(tokio_rusqlite::Error::ConnectionClosed).is_transient());
    }
}
