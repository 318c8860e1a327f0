//! Error types for the event store.

use std::time::Duration;

/// Errors returned by the event store engine.
///
/// `InvalidPayload` and `InvalidArgument` are raised before any store access
/// and are never retried. `NotFound` is an expected outcome of a lookup.
/// Only `Storage` indicates that something went wrong on the server side.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The payload is not a JSON object.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A required field is missing or empty.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The identifier is malformed or no record carries it.
    #[error("event not found")]
    NotFound,

    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StoreError {
    /// Returns true when the failure was caused by the operation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Timeout(_)))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(e))
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(StorageError::Pool(e))
    }
}

/// Persistence-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A SQLite statement failed.
    #[error("storage database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection became available.
    #[error("storage pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The operation did not finish within its time bound.
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// A uniqueness constraint was still violated after the single retry.
    #[error("storage constraint violation after retry: {0}")]
    ConstraintViolation(rusqlite::Error),

    /// The blocking worker running the operation failed.
    #[error("storage task failed: {0}")]
    Task(String),

    /// A stored row could not be decoded.
    #[error("storage row is corrupt: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// A caller-facing description that carries the failure class but none
    /// of the SQL, paths or identifiers found in the `Display` output.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "storage operation timed out",
            Self::Pool(_) => "storage unavailable",
            Self::ConstraintViolation(_) => "storage conflict, retry the request",
            Self::Database(_) | Self::Task(_) | Self::Corrupt(_) => "storage failure",
        }
    }
}
