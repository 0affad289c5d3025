//! The Worker loop (`# 4.5`): reap → dispatch → execute → finalize, honoring
//! cooperative shutdown. State is the cancellation signal, a steady-tick
//! poll timer, a worker id, and a Store handle — nothing else; correctness
//! never depends on anything held in worker memory (`# 9`).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::executor::{Executor, Outcome};
use crate::job::JobState;
use crate::reaper::Reaper;
use crate::retry::{self, Disposition};
use crate::store::{JobStore, WorkerRegistration};

/// How many times the worker retries a `finalize_*` call that fails
/// transiently before giving up and letting the Reaper recover the job
/// (`# 4.5` step 4).
const MAX_FINALIZE_ATTEMPTS: u32 = 5;

const FINALIZE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Coarse cadence at which a worker runs its own reaper step, independent
/// of `worker_poll_interval` (`# 4.5` step 2, `# 4.7`).
const REAPER_TICK: Duration = Duration::from_secs(60);

pub struct Worker<S: JobStore> {
    id: String,
    store: Arc<S>,
    config: Config,
    executor: Executor,
    reaper: Reaper,
    shutdown: CancellationToken,
    started_at: chrono::DateTime<Utc>,
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(id: impl Into<String>, store: Arc<S>, config: Config, shutdown: CancellationToken) -> Self {
        Worker {
            id: id.into(),
            store,
            config,
            executor: Executor::new(),
            reaper: Reaper::default(),
            shutdown,
            started_at: Utc::now(),
        }
    }

    /// Run the loop until `shutdown` is cancelled. Consumes `self`; intended
    /// to be driven inside a spawned task by [`crate::pool::WorkerPool`].
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");
        let mut last_reap = tokio::time::Instant::now() - REAPER_TICK;
        let poll_interval = Duration::from_secs_f64(self.config.worker_poll_interval.max(0.001));

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // `promote_due` is cheap (one UPDATE) and is the sole mechanism
            // that returns a due `failed` job to `pending` (`# 9`), so it
            // runs every tick at `worker_poll_interval` granularity. The
            // expensive stale-claim scan stays on the coarse `REAPER_TICK`
            // schedule.
            self.reaper.promote_due_step(self.store.as_ref()).await;

            if last_reap.elapsed() >= REAPER_TICK {
                self.reaper.reap_stale_step(self.store.as_ref()).await;
                last_reap = tokio::time::Instant::now();
            }

            self.heartbeat().await;

            let now = Utc::now();
            match self.store.claim_next(now).await {
                Ok(Some(job)) => {
                    debug!(worker_id = %self.id, job_id = %job.id, "claimed job");
                    self.execute_and_finalize(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "claim_next failed");
                    sleep(poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    async fn heartbeat(&self) {
        let registration = WorkerRegistration {
            worker_id: self.id.clone(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
        };
        if let Err(e) = self.store.heartbeat(registration).await {
            warn!(worker_id = %self.id, error = %e, "heartbeat failed");
        }
    }

    /// Execute one claimed job outside any Store transaction, then apply
    /// the retry policy and finalize, retrying transient finalize failures
    /// a bounded number of times (`# 4.5` step 4).
    async fn execute_and_finalize(&self, job: crate::job::Job) {
        let outcome = self.executor.run(&job).await;
        let now = Utc::now();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match &outcome {
                Outcome::Success => self.store.finalize_success(&job.id, now).await,
                Outcome::RetryableFailure { message } => {
                    let disposition = retry::decide_from_attempts_before(
                        job.attempts,
                        job.max_retries,
                        self.config.backoff_base,
                        now,
                    );
                    match disposition {
                        Disposition::Dead => {
                            warn!(worker_id = %self.id, job_id = %job.id, "job moved to dead letter queue");
                            self.store
                                .finalize_failure(&job.id, now, message, JobState::Dead, None)
                                .await
                        }
                        Disposition::Failed { next_retry_at } => {
                            self.store
                                .finalize_failure(
                                    &job.id,
                                    now,
                                    message,
                                    JobState::Failed,
                                    Some(next_retry_at),
                                )
                                .await
                        }
                    }
                }
            };

            match result {
                Ok(()) => {
                    debug!(worker_id = %self.id, job_id = %job.id, "finalized job");
                    return;
                }
                Err(e) if attempt >= MAX_FINALIZE_ATTEMPTS => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempt,
                        error = %e,
                        "giving up on finalize after bounded retries; job will be reaped"
                    );
                    return;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, job_id = %job.id, attempt, error = %e, "finalize failed, retrying");
                    sleep(FINALIZE_RETRY_BACKOFF).await;
                }
            }
        }
    }
}
