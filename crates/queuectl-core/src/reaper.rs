//! The Reaper (`# 4.7`): periodically returns abandoned `processing` jobs to
//! `pending`, and promotes due `failed` jobs back to `pending` (the chosen
//! resolution of the `# 9` `failed`-re-eligibility open question).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::store::JobStore;

/// Practical default for how long a job may sit in `processing` with no
/// heartbeat progress before it is presumed crashed: the documented
/// `max(timeout_seconds) + margin` floor, concretized here since this
/// engine has no cross-job timeout registry to inspect at reap time.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default cadence between reaper ticks, both for a worker's own coarse
/// schedule and for [`spawn_background`].
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct Reaper {
    stale_timeout: Duration,
}

impl Default for Reaper {
    fn default() -> Self {
        Reaper {
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }
}

impl Reaper {
    pub fn with_stale_timeout(stale_timeout: Duration) -> Self {
        Reaper { stale_timeout }
    }

    /// Rescue stale `processing` claims: the expensive half of a reap pass,
    /// meant to run on the coarse `REAPER_TICK`/`DEFAULT_REAP_INTERVAL`
    /// schedule rather than every worker tick.
    pub async fn reap_stale_step<S: JobStore + ?Sized>(&self, store: &S) {
        let now = Utc::now();
        let threshold = now - chrono::Duration::from_std(self.stale_timeout).unwrap_or_default();

        match store.reap_stale(threshold).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "reaper rescued stale processing jobs"),
            Err(e) => warn!(error = %e, "reap_stale failed"),
        }
    }

    /// Promote `failed` jobs whose backoff has elapsed back to `pending`:
    /// a single cheap `UPDATE`, meant to run on *every* worker tick so a
    /// job's `next_retry_at` is honored at `worker_poll_interval`
    /// granularity instead of waiting on the coarse stale-claim sweep.
    pub async fn promote_due_step<S: JobStore + ?Sized>(&self, store: &S) {
        let now = Utc::now();
        match store.promote_due(now).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "reaper promoted due failed jobs to pending"),
            Err(e) => warn!(error = %e, "promote_due failed"),
        }
    }

    /// Run a full reap pass: both halves above, back to back. Used where
    /// there is no finer-grained tick to split them across (e.g.
    /// [`spawn_background`]'s standalone interval).
    pub async fn tick<S: JobStore + ?Sized>(&self, store: &S) {
        self.reap_stale_step(store).await;
        self.promote_due_step(store).await;
    }
}

/// Spawn the reaper as a standalone background task on its own interval,
/// independent of any worker's per-tick schedule — mirroring the pattern
/// this codebase already uses to run its own stale-job reclaimer as a
/// detached periodic task alongside (not inside) its workers.
///
/// Intended for a process that wants reaping to continue even with zero
/// workers configured, or at a cadence decoupled from `worker_poll_interval`.
pub fn spawn_background<S: JobStore + 'static>(
    store: Arc<S>,
    reaper: Reaper,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    reaper.tick(store.as_ref()).await;
                }
            }
        }
    })
}
