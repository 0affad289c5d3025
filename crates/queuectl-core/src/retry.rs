//! The retry policy: a pure function of `(attempts, max_retries, backoff_base)`.
//!
//! Deliberately separated from the [`crate::executor::Executor`] and the
//! [`crate::store::JobStore`] so it can be exercised exhaustively with
//! plain `#[test]` functions, no runtime or store required.

use chrono::{DateTime, Duration, Utc};

/// What the next Store transition should be after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `attempts_after_this_run >= max_retries`: move straight to `dead`.
    Dead,
    /// `attempts_after_this_run < max_retries`: move to `failed` with the
    /// computed eligibility floor.
    Failed { next_retry_at: DateTime<Utc> },
}

/// Integer exponential backoff: `backoff_base ^ a` seconds, `a >= 1`.
///
/// No jitter, no cap other than `max_retries` reaching the attempt count
/// (see [`decide`]). `saturating_pow` guards only against numeric overflow
/// for pathological `(a, backoff_base)` pairs; it is not a policy cap.
pub fn backoff_seconds(a: i64, backoff_base: i64) -> i64 {
    debug_assert!(a >= 1, "backoff is only defined for a >= 1");
    debug_assert!(backoff_base >= 1, "backoff_base must be >= 1");
    backoff_base.saturating_pow(a.clamp(0, u32::MAX as i64) as u32)
}

/// Decide the next state for a job whose attempt count has just become
/// `attempts_after_this_run` following a retryable execution failure.
///
/// This is the function named in the retry policy's contract: given the
/// attempt count *after* the run that just failed, the job's `max_retries`
/// ceiling, and the configured `backoff_base`, produce either `Dead` or a
/// `Failed` disposition carrying the next eligibility floor.
pub fn decide(
    attempts_after_this_run: i64,
    max_retries: i64,
    backoff_base: i64,
    now: DateTime<Utc>,
) -> Disposition {
    if attempts_after_this_run >= max_retries {
        return Disposition::Dead;
    }
    let delay = backoff_seconds(attempts_after_this_run, backoff_base);
    Disposition::Failed {
        next_retry_at: now + Duration::seconds(delay),
    }
}

/// Convenience wrapper taking the attempt count *before* this run, as held
/// on the claimed Job snapshot the worker loop has in hand.
pub fn decide_from_attempts_before(
    attempts_before: i64,
    max_retries: i64,
    backoff_base: i64,
    now: DateTime<Utc>,
) -> Disposition {
    decide(attempts_before + 1, max_retries, backoff_base, now)
}
