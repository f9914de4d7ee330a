//! # Database Error Types
//!
//! Error types for outbox storage operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Full vs unavailable vs query failure          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (agrilink-sync) ← Stable error code                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Gateway error body (507 / 503 / 500)                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// SQLite primary result codes we react to.
const SQLITE_BUSY: i32 = 5;
const SQLITE_IOERR: i32 = 10;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The outbox cannot accept more records.
    ///
    /// ## When This Occurs
    /// - SQLite reports "database or disk is full"
    /// - The configured capacity of unresolved records is reached
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// The database cannot be reached.
    ///
    /// ## When This Occurs
    /// - Pool closed (shutdown in progress)
    /// - Pool acquire timed out
    /// - File cannot be opened, I/O error, database locked
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// True for errors a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::StorageFull(_) | DbError::StorageUnavailable(_))
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// SQLITE_FULL (13)                     → DbError::StorageFull
/// SQLITE_IOERR / CANTOPEN / BUSY       → DbError::StorageUnavailable
/// Io, PoolClosed, PoolTimedOut         → DbError::StorageUnavailable
/// RowNotFound                          → DbError::NotFound
/// other database errors                → DbError::QueryFailed
/// Other                                → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Record", "unknown"),

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message().to_string();
                // SQLite reports extended codes; the low byte is the primary code.
                let primary = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);

                match primary {
                    Some(SQLITE_FULL) => DbError::StorageFull(msg),
                    Some(SQLITE_IOERR | SQLITE_CANTOPEN | SQLITE_BUSY) => {
                        DbError::StorageUnavailable(msg)
                    }
                    _ if msg.contains("database or disk is full") => DbError::StorageFull(msg),
                    _ => DbError::QueryFailed(msg),
                }
            }

            sqlx::Error::Io(e) => DbError::StorageUnavailable(e.to_string()),

            sqlx::Error::PoolTimedOut => {
                DbError::StorageUnavailable("Connection pool timed out".to_string())
            }

            sqlx::Error::PoolClosed => DbError::StorageUnavailable("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_unavailable() {
        assert!(matches!(
            DbError::from(sqlx::Error::PoolClosed),
            DbError::StorageUnavailable(_)
        ));
        assert!(matches!(
            DbError::from(sqlx::Error::PoolTimedOut),
            DbError::StorageUnavailable(_)
        ));
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(matches!(DbError::from(sqlx::Error::Io(io)), DbError::StorageUnavailable(_)));
    }

    #[test]
    fn test_transient() {
        assert!(DbError::StorageFull("x".into()).is_transient());
        assert!(!DbError::not_found("OutboxRecord", 4).is_transient());
    }
}
