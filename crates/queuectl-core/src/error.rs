//! Error taxonomy.
//!
//! `ClientError` and `StoreError` are `thiserror` enums: each variant names
//! a distinct failure kind with enough context to log or report without
//! string matching. Code above the Store (the worker loop, the
//! demonstration binary) folds these into `anyhow::Error` at the boundary,
//! the way this codebase's job-store adapters already do.

use thiserror::Error;

/// Rejected at the boundary without touching any persisted state.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("malformed job submission: {0}")]
    MalformedPayload(String),

    #[error("job id already exists: {0}")]
    DuplicateId(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} is not in the dead letter queue")]
    NotInDlq(String),

    #[error("invalid config key: {0}")]
    InvalidConfigKey(String),

    #[error("invalid config value for {key}: {value}")]
    InvalidConfigValue { key: String, value: String },
}

/// Failures surfaced by a [`crate::store::JobStore`] implementation.
///
/// `Transient` covers a backend that already retried internally a bounded
/// number of times and is reporting that it still could not commit.
/// `Fatal` corresponds to disk-full, corrupt-store, or schema-mismatch
/// conditions that should stop the pool from accepting new claims.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("transient store failure after internal retries: {0}")]
    Transient(String),

    #[error("fatal store failure: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
