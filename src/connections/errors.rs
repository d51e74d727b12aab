//! Connection Manager error types.
//!
//! Messages never include secret material. Driver errors are reduced to their
//! message text before they reach this type.

use thiserror::Error;

/// Errors raised while resolving, opening or querying a user connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No connection with this id belongs to the owner.
    #[error("connection {connection_id} not found for owner {owner_id}")]
    NotFound {
        owner_id: i64,
        connection_id: i64,
    },

    /// The stored secret could not be decrypted (wrong master key or tampering).
    #[error("failed to decrypt stored secret: {reason}")]
    DecryptionFailed {
        reason: String,
    },

    /// The database could not be reached or refused the credentials.
    #[error("connection failed to {target}: {reason}")]
    ConnectionFailed {
        target: String,
        reason: String,
    },

    /// The query ran past the configured timeout and was cancelled.
    #[error("query timed out after {timeout_secs}s")]
    QueryTimeout {
        timeout_secs: u64,
    },

    /// The statement is not a single read-only query.
    #[error("unsafe SQL rejected: {reason}")]
    UnsafeSqlRejected {
        reason: String,
    },

    /// The database rejected the statement (syntax, unknown column, ...).
    #[error("query failed: {message}")]
    QueryFailed {
        message: String,
    },

    /// The record names a database type no driver handles.
    #[error("unsupported database type: {db_type}")]
    UnsupportedDbType {
        db_type: String,
    },

    /// The connection record is missing fields its driver needs.
    #[error("invalid connection record: {reason}")]
    InvalidRecord {
        reason: String,
    },

    /// The caller went away while the query was running.
    #[error("query cancelled")]
    Cancelled,

    /// The record store failed.
    #[error("connection store error: {reason}")]
    Storage {
        reason: String,
    },
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(e: rusqlite::Error) -> Self {
        ConnectionError::QueryFailed {
            message: e.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for ConnectionError {
    fn from(e: tokio_postgres::Error) -> Self {
        let message = match e.as_db_error() {
            Some(db) => db.message().to_string(),
            None => e.to_string(),
        };
        ConnectionError::QueryFailed { message }
    }
}
