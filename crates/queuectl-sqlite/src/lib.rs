//! SQLite-backed [`JobStore`] for QueueCTL.
//!
//! The sole concrete durable backend in this workspace. Follows the
//! serialization discipline in `# 5` by pooling a single SQLite connection
//! (`max_connections(1)`): every operation — read or write — runs through
//! that one connection, so there is never a concurrent writer to race
//! against inside this process. The `WHERE id = ? AND state = 'pending'`
//! guard on `claim_next`'s `UPDATE` is kept regardless, since it is what
//! keeps this backend correct if more than one process ever opens the same
//! database file.
//!
//! Migrations are embedded at compile time via `sqlx::migrate!` and applied
//! automatically by [`SqliteStore::connect`].

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use queuectl_core::error::{ClientError, StoreError};
use queuectl_core::job::{Job, JobState};
use queuectl_core::store::{JobStore, StateCounts, WorkerRegistration};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

fn store_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return StoreError::Client(ClientError::DuplicateId(db_err.message().to_string()));
        }
    }
    StoreError::Other(anyhow::Error::from(e))
}

/// A SQLite-backed durable store.
///
/// Worker registrations (`# 3`'s ephemeral record) are kept in an
/// in-process map rather than a third table: they are explicitly not
/// authoritative for scheduling and do not need to survive a restart, only
/// the lifetime of this process (`# 9`).
pub struct SqliteStore {
    pool: SqlitePool,
    registry: DashMap<String, WorkerRegistration>,
}

impl SqliteStore {
    /// Open (creating if absent) the SQLite database at `path` and run
    /// embedded migrations.
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(SqliteStore {
            pool,
            registry: DashMap::new(),
        })
    }

    /// Open an in-memory store, primarily for tests (`# 8`'s "durability
    /// round-trip" property uses a temp file instead, since an in-memory
    /// database does not survive a simulated process restart).
    pub async fn connect_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(SqliteStore {
            pool,
            registry: DashMap::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, StoreError> {
    let state_str: String = row.try_get("state").map_err(store_err)?;
    let state = state_str
        .parse::<JobState>()
        .map_err(|e| StoreError::Fatal(format!("corrupt state column: {e}")))?;

    Ok(Job {
        id: row.try_get("id").map_err(store_err)?,
        command: row.try_get("command").map_err(store_err)?,
        state,
        attempts: row.try_get("attempts").map_err(store_err)?,
        max_retries: row.try_get("max_retries").map_err(store_err)?,
        priority: row.try_get("priority").map_err(store_err)?,
        run_at: row.try_get("run_at").map_err(store_err)?,
        timeout_seconds: row.try_get("timeout_seconds").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
        next_retry_at: row.try_get("next_retry_at").map_err(store_err)?,
        completed_at: row.try_get("completed_at").map_err(store_err)?,
        error_message: row.try_get("error_message").map_err(store_err)?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, command, state, attempts, max_retries, priority, run_at,
                 timeout_seconds, created_at, updated_at, next_retry_at,
                 completed_at, error_message)
            VALUES (?, ?, 'pending', 0, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.timeout_seconds)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(job_id = %job.id, "inserted job");
        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut tx: Transaction<'_, Sqlite> = self.pool.begin().await.map_err(store_err)?;

        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state = 'pending' AND (run_at IS NULL OR run_at <= ?)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(store_err)?;
            return Ok(None);
        };

        let candidate = row_to_job(&row)?;

        let result = sqlx::query(
            "UPDATE jobs SET state = 'processing', updated_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(now)
        .bind(&candidate.id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if result.rows_affected() != 1 {
            // Lost the race (or another process already moved it): no stale
            // read is surfaced, the caller just retries on its next tick.
            tx.rollback().await.map_err(store_err)?;
            return Ok(None);
        }

        tx.commit().await.map_err(store_err)?;

        let mut claimed = candidate;
        claimed.state = JobState::Processing;
        claimed.updated_at = now;
        Ok(Some(claimed))
    }

    async fn finalize_success(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', completed_at = ?, error_message = NULL,
                attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND state = 'processing'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        require_one_row(result.rows_affected(), id, "processing")
    }

    async fn finalize_failure(
        &self,
        id: &str,
        now: DateTime<Utc>,
        err: &str,
        next_state: JobState,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = match next_state {
            JobState::Failed => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'failed', error_message = ?, next_retry_at = ?,
                        attempts = attempts + 1, updated_at = ?
                    WHERE id = ? AND state = 'processing'
                    "#,
                )
                .bind(err)
                .bind(next_retry_at)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
            }
            JobState::Dead => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'dead', error_message = ?, completed_at = ?,
                        attempts = attempts + 1, updated_at = ?
                    WHERE id = ? AND state = 'processing'
                    "#,
                )
                .bind(err)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
            }
            other => {
                return Err(StoreError::Fatal(format!(
                    "finalize_failure called with non-terminal next_state {other}"
                )))
            }
        }
        .map_err(store_err)?;

        require_one_row(result.rows_affected(), id, "processing")
    }

    async fn reap_stale(&self, threshold: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', error_message = 'reaped: worker presumed crashed',
                updated_at = ?
            WHERE state = 'processing' AND updated_at < ?
            "#,
        )
        .bind(now)
        .bind(threshold)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', updated_at = ?
            WHERE state = 'failed' AND next_retry_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected())
    }

    async fn dlq_retry(&self, id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, completed_at = NULL,
                next_retry_at = NULL, error_message = NULL, updated_at = ?
            WHERE id = ? AND state = 'dead'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Distinguish "not found at all" from "found but not dead" for a
        // more useful client diagnostic.
        match self.get(id).await {
            Ok(_) => Err(StoreError::Client(ClientError::NotInDlq(id.to_string()))),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, id: &str) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(StoreError::Client(ClientError::NotFound(id.to_string()))),
        }
    }

    async fn list(&self, state: Option<JobState>, limit: Option<i64>) -> Result<Vec<Job>, StoreError> {
        let limit = limit.unwrap_or(i64::MAX);
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(state.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn counts_by_state(&self) -> Result<StateCounts, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) as n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(store_err)?;
            let n: i64 = row.try_get("n").map_err(store_err)?;
            match state.parse::<JobState>() {
                Ok(JobState::Pending) => counts.pending = n,
                Ok(JobState::Processing) => counts.processing = n,
                Ok(JobState::Completed) => counts.completed = n,
                Ok(JobState::Failed) => counts.failed = n,
                Ok(JobState::Dead) => counts.dead = n,
                Err(e) => warn!(state = %state, error = %e, "unrecognized state in counts query"),
            }
        }
        Ok(counts)
    }

    async fn config_get(&self, key: &str) -> Result<String, StoreError> {
        // Validate the key against the known set, and compute its default,
        // before ever touching the Store.
        let default = queuectl_core::config::Config::default()
            .get(key)
            .map_err(StoreError::Client)?;

        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => row.try_get("value").map_err(store_err),
            None => Ok(default),
        }
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        // Validate key and value shape by applying them to a scratch config.
        let mut scratch = queuectl_core::config::Config::default();
        scratch.apply(key, value).map_err(StoreError::Client)?;

        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn heartbeat(&self, registration: WorkerRegistration) -> Result<(), StoreError> {
        self.registry
            .insert(registration.worker_id.clone(), registration);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, StoreError> {
        Ok(self.registry.iter().map(|e| e.value().clone()).collect())
    }
}

fn require_one_row(rows_affected: u64, id: &str, expected_state: &str) -> Result<(), StoreError> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(StoreError::Client(ClientError::NotFound(format!(
            "{id} (expected current state {expected_state})"
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::job::Job;

    async fn store() -> SqliteStore {
        SqliteStore::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();
        let job = store.get("a").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn insert_duplicate_id_fails() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();
        let err = store.insert(Job::new("a", "true")).await.unwrap_err();
        assert!(matches!(err, StoreError::Client(ClientError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn claim_next_picks_highest_priority_then_fifo() {
        let store = store().await;
        store.insert(Job::new("lo", "true")).await.unwrap();
        store
            .insert(Job::new("hi", "true").with_priority(10))
            .await
            .unwrap();

        let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, "hi");
        assert_eq!(claimed.state, JobState::Processing);
    }

    #[tokio::test]
    async fn claim_next_ties_break_on_id_ascending() {
        let store = store().await;
        // Same priority and the same `created_at` instant (stamped directly
        // rather than via `insert`, which would otherwise stagger them by
        // real wall-clock time): the tie-break is `id ASC`.
        let same_instant = Utc::now();
        for id in ["z", "a", "m"] {
            sqlx::query(
                "INSERT INTO jobs (id, command, state, attempts, max_retries, priority, created_at, updated_at) \
                 VALUES (?, 'true', 'pending', 0, 3, 0, ?, ?)",
            )
            .bind(id)
            .bind(same_instant)
            .bind(same_instant)
            .execute(store.pool())
            .await
            .unwrap();
        }

        let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
    }

    #[tokio::test]
    async fn claim_next_respects_run_at() {
        let store = store().await;
        let future = Utc::now() + chrono::Duration::seconds(60);
        store
            .insert(Job::new("future", "true").with_run_at(future))
            .await
            .unwrap();

        assert!(store.claim_next(Utc::now()).await.unwrap().is_none());
        assert!(store.claim_next(future + chrono::Duration::seconds(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_next_is_a_one_shot_guarded_update() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();

        let first = store.claim_next(Utc::now()).await.unwrap();
        assert!(first.is_some());
        let second = store.claim_next(Utc::now()).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn finalize_success_sets_completed() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();
        store.claim_next(Utc::now()).await.unwrap();
        store.finalize_success("a", Utc::now()).await.unwrap();

        let job = store.get("a").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn finalize_success_is_not_repeatable_on_a_completed_job() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();
        store.claim_next(Utc::now()).await.unwrap();
        store.finalize_success("a", Utc::now()).await.unwrap();

        // `completed` is terminal: a second finalize call against the same
        // id is rejected rather than silently re-applied.
        let err = store.finalize_success("a", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Client(ClientError::NotFound(_))));
        assert_eq!(store.get("a").await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn finalize_failure_dead_sets_completed_at_not_next_retry() {
        let store = store().await;
        store
            .insert(Job::new("a", "true").with_max_retries(1))
            .await
            .unwrap();
        store.claim_next(Utc::now()).await.unwrap();
        store
            .finalize_failure("a", Utc::now(), "boom", JobState::Dead, None)
            .await
            .unwrap();

        let job = store.get("a").await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
        assert!(job.completed_at.is_some());
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn reap_stale_returns_processing_jobs_to_pending() {
        let store = store().await;
        store.insert(Job::new("a", "sleep 60")).await.unwrap();
        store.claim_next(Utc::now()).await.unwrap();

        // Nothing stale yet.
        assert_eq!(store.reap_stale(Utc::now() - chrono::Duration::seconds(1)).await.unwrap(), 0);

        let job = store.get("a").await.unwrap();
        let future_threshold = job.updated_at + chrono::Duration::seconds(1);
        assert_eq!(store.reap_stale(future_threshold).await.unwrap(), 1);

        let reaped = store.get("a").await.unwrap();
        assert_eq!(reaped.state, JobState::Pending);
        assert_eq!(reaped.attempts, 0);
        assert!(reaped.error_message.unwrap().contains("reaped"));
    }

    #[tokio::test]
    async fn dlq_retry_resets_dead_job() {
        let store = store().await;
        store
            .insert(Job::new("a", "false").with_max_retries(1))
            .await
            .unwrap();
        store.claim_next(Utc::now()).await.unwrap();
        store
            .finalize_failure("a", Utc::now(), "boom", JobState::Dead, None)
            .await
            .unwrap();

        store.dlq_retry("a").await.unwrap();
        let job = store.get("a").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn dlq_retry_on_non_dead_job_fails() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();
        let err = store.dlq_retry("a").await.unwrap_err();
        assert!(matches!(err, StoreError::Client(ClientError::NotInDlq(_))));
    }

    #[tokio::test]
    async fn config_get_applies_default_when_absent() {
        let store = store().await;
        assert_eq!(store.config_get("max-retries").await.unwrap(), "3");
    }

    #[tokio::test]
    async fn config_set_then_get_round_trips() {
        let store = store().await;
        store.config_set("backoff-base", "5").await.unwrap();
        assert_eq!(store.config_get("backoff-base").await.unwrap(), "5");
    }

    #[tokio::test]
    async fn config_set_rejects_invalid_value() {
        let store = store().await;
        assert!(store.config_set("backoff-base", "0").await.is_err());
    }

    #[tokio::test]
    async fn counts_by_state_reflects_inserts() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();
        store.insert(Job::new("b", "true")).await.unwrap();
        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert!(counts.is_drained() == false);
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let store = store().await;
        store.insert(Job::new("a", "true")).await.unwrap();
        store.claim_next(Utc::now()).await.unwrap();
        store.insert(Job::new("b", "true")).await.unwrap();

        let pending = store.list(Some(JobState::Pending), None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    #[tokio::test]
    async fn heartbeat_then_list_workers_round_trips() {
        let store = store().await;
        let now = Utc::now();
        store
            .heartbeat(WorkerRegistration {
                worker_id: "worker-0".into(),
                started_at: now,
                last_heartbeat: now,
            })
            .await
            .unwrap();

        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "worker-0");
    }

    #[tokio::test]
    async fn durability_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queuectl.db");
        let path_str = path.to_str().unwrap().to_string();

        {
            let store = SqliteStore::connect(&path_str).await.unwrap();
            store.insert(Job::new("a", "true")).await.unwrap();
            store.claim_next(Utc::now()).await.unwrap();
        }

        let reopened = SqliteStore::connect(&path_str).await.unwrap();
        let job = reopened.get("a").await.unwrap();
        assert_eq!(job.state, JobState::Processing);
    }
}
