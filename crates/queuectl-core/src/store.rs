//! The `JobStore` trait: the durable, transactional persistence contract
//! every backend implements (`# 4.1`).
//!
//! This crate is backend-agnostic — it depends on no concrete database
//! crate, mirroring the split between this codebase's policy-light job
//! interfaces and its concrete Postgres/SQLite adapter crates. The only
//! concrete implementation in this workspace lives in `queuectl-sqlite`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::{ClientError, StoreError};
use crate::job::{Job, JobState};

/// An ephemeral worker registration record (`# 3`).
///
/// Observational only: the registry is not authoritative for scheduling,
/// the Job row in the Store is (see `# 9`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Aggregate counts by state, as returned by `counts_by_state` (`# 4.1`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StateCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

impl StateCounts {
    /// The observable "drain" condition from the glossary: no work left
    /// pending, in flight, or waiting out a backoff.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0 && self.failed == 0
    }

    pub fn get(&self, state: JobState) -> i64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }
}

/// The durable, transactional persistence contract.
///
/// Every mutation here runs under a serialized write transaction (`# 5`):
/// implementations MUST guard `claim_next`'s update with
/// `WHERE id = ? AND state = 'pending'` (or equivalent) so a lost race
/// yields zero affected rows rather than a stale read, which is what makes
/// invariant I4 hold under concurrent callers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job in `pending` with `attempts=0`. Fails with
    /// [`ClientError::DuplicateId`] if `job.id` already exists.
    async fn insert(&self, job: Job) -> Result<(), StoreError>;

    /// Atomically select and claim one eligible job, or `None` if none are
    /// eligible. Eligible: `state=pending` and (`run_at` is null or
    /// `run_at <= now`). Ordering: `priority DESC`, `created_at ASC`,
    /// `id ASC`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Requires current state `processing`. Transitions to `completed`.
    async fn finalize_success(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Requires current state `processing`. Transitions to `failed` or
    /// `dead` per `next_state`, storing `err` and either `next_retry_at`
    /// (when `failed`) or `completed_at` (when `dead`).
    async fn finalize_failure(
        &self,
        id: &str,
        now: DateTime<Utc>,
        err: &str,
        next_state: JobState,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Return every `processing` job whose `updated_at < threshold` to
    /// `pending`, preserving `attempts`. Returns the number of rows reaped.
    async fn reap_stale(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Move every `failed` job whose `next_retry_at <= now` to `pending`.
    /// The chosen resolution of the `# 9` open question: this is the sole
    /// mechanism by which a `failed` job becomes eligible again; the
    /// Dispatcher's eligibility set stays limited to `pending` rows.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Reset a `dead` job to `pending`, zeroing `attempts` and clearing
    /// `completed_at`/`next_retry_at`/`error_message`. Fails with
    /// [`ClientError::NotInDlq`] if `id` is not currently `dead`.
    async fn dlq_retry(&self, id: &str) -> Result<(), StoreError>;

    /// Fetch one job by id, or [`ClientError::NotFound`].
    async fn get(&self, id: &str) -> Result<Job, StoreError>;

    /// List jobs, optionally filtered by state, newest-created first,
    /// capped at `limit` (when given).
    async fn list(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>, StoreError>;

    /// Aggregate counts by state, for the operator `status` surface.
    async fn counts_by_state(&self) -> Result<StateCounts, StoreError>;

    /// Read one config value, substituting the documented default when the
    /// row is absent. [`ClientError::InvalidConfigKey`] if `key` is not one
    /// of the three recognized tuneables.
    async fn config_get(&self, key: &str) -> Result<String, StoreError>;

    /// Overwrite one config value, validating it the way [`Config::apply`]
    /// would.
    async fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Resolve the full tuneable [`Config`] by reading all three keys
    /// (each already default-substituted by `config_get`).
    async fn config_snapshot(&self) -> Result<Config, StoreError> {
        let mut cfg = Config::default();
        for key in crate::config::ALL_KEYS {
            let value = self.config_get(key).await?;
            cfg.apply(key, &value).map_err(StoreError::Client)?;
        }
        Ok(cfg)
    }

    /// Register or refresh a worker's heartbeat. Observational only.
    async fn heartbeat(&self, registration: WorkerRegistration) -> Result<(), StoreError>;

    /// List all known worker registrations, for the operator `workers`
    /// surface (heartbeat age is computed by the caller from `now`).
    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, StoreError>;
}
