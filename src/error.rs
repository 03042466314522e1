use rusqlite::{Error as RusqliteError, ErrorCode};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VideoIndexError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into VideoIndexError automatically

    #[error("Database error: {0}")]
    DatabaseError(RusqliteError), // See From impl below: constraint violations become Conflict

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Root directory '{}' is unreadable", .0.display())]
    RootUnreadable(PathBuf),

    #[error("Scan interrupted")]
    ScanInterrupted,

    #[error("Migration to schema version {version} failed: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<RusqliteError> for VideoIndexError {
    fn from(err: RusqliteError) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => VideoIndexError::Conflict(err.to_string()),
            _ => VideoIndexError::DatabaseError(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_constraint_violation_maps_to_conflict() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY); INSERT INTO t (k) VALUES ('a');")
            .unwrap();

        let err: VideoIndexError = conn
            .execute("INSERT INTO t (k) VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, VideoIndexError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn test_other_sqlite_errors_stay_database_errors() {
        let conn = Connection::open_in_memory().unwrap();
        let err: VideoIndexError = conn
            .execute("SELECT * FROM missing_table", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, VideoIndexError::DatabaseError(_)), "got {err:?}");
    }

    #[test]
    fn test_root_unreadable_message() {
        let err = VideoIndexError::RootUnreadable(PathBuf::from("/videos"));
        assert_eq!(err.to_string(), "Root directory '/videos' is unreadable");
    }
}
