use serde::Serialize;
use thiserror::Error;

/// Failure of a single fetch attempt. Aborts the whole cycle.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message")]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Failure to turn one raw record into a canonical record.
/// Recovered per record: the record is skipped and the cycle continues.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum NormalizationError {
    #[error("Missing key field: {field}")]
    MissingKeyField { field: String },

    #[error("Cannot coerce field '{field}': {reason}")]
    TypeCoercionFailure { field: String, reason: String },

    #[error("Duplicate identity key in snapshot: {key}")]
    DuplicateKey { key: String },
}

/// Error raised by a time-series storage backend.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Rejected(err.to_string())
    }
}

/// Partial persistence failure: the keys whose points were not stored.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("Failed to persist {} record(s): {message}", failed_keys.len())]
pub struct PersistError {
    pub failed_keys: Vec<String>,
    pub message: String,
}

/// Archive or change-log failure. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ArchiveError {
    #[error("Archive write failed for '{name}': {message}")]
    Store { name: String, message: String },

    #[error("Change log write failed: {0}")]
    ChangeLog(String),
}

/// Loading or replacing the persisted baseline failed.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum StateError {
    #[error("Failed to load state: {0}")]
    Load(String),

    #[error("Failed to replace state: {0}")]
    Replace(String),
}

/// Any error recorded in a cycle result.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", content = "error", rename_all = "snake_case")]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CollectorError {
    fn from(err: rusqlite::Error) -> Self {
        CollectorError::Store(StoreError::Unavailable(err.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
