//! The Job entity and its state machine.
//!
//! A `Job` is the unit the engine schedules, claims, executes, and retires.
//! Its `state` field is the single source of truth for where a job sits in
//! its lifecycle; nothing about scheduling correctness depends on anything
//! held in worker memory (see [`crate::worker`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default per-job execution deadline when `timeout_seconds` is absent.
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 300;

/// Where a job currently sits in its lifecycle.
///
/// ```text
/// pending ──claim──▶ processing ──ok──▶ completed
///                          │
///                          ├─err, attempts<max──▶ failed ──due──▶ pending
///                          └─err, attempts≥max──▶ dead ──dlq retry──▶ pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unrecognized job state: {other}")),
        }
    }
}

/// A durable unit of work: an opaque shell command plus the scheduling and
/// retry metadata the engine needs to run it exactly once on success.
///
/// Invariants I1-I6 (see the durable-store documentation) hold across every
/// transaction a [`crate::store::JobStore`] commits; `Job` itself is just
/// the snapshot shape, it does not enforce them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    /// Construct a fresh job as it would look immediately before `insert`.
    ///
    /// `state` is always `pending` and `attempts` is always zero at this
    /// point; the Store is what stamps `created_at`/`updated_at` on insert,
    /// but a caller may inspect the would-be snapshot before submitting it.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Job {
            id: id.into(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            priority: 0,
            run_at: None,
            timeout_seconds: None,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// The effective per-job execution deadline, applying the documented
    /// default when the job did not specify one.
    pub fn effective_timeout_seconds(&self) -> i64 {
        self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS)
    }

    /// A `pending` job is eligible for claim once `now >= run_at` (or
    /// `run_at` is unset). This mirrors the Store's `claim_next` predicate
    /// for callers that want to reason about eligibility without a round
    /// trip, e.g. in tests.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// The line-delimited job submission payload recognized at the boundary.
///
/// Unknown fields are rejected (`deny_unknown_fields`) per the external
/// interface contract: a malformed or unrecognized payload is a
/// [`crate::error::ClientError`], never a partially-applied job.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSubmission {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

impl JobSubmission {
    /// Parse one line of the line-delimited submission payload (`# 6`).
    /// Unknown fields are rejected by `deny_unknown_fields` at this point,
    /// before any defaulting or validation in [`JobSubmission::into_job`].
    pub fn parse_line(line: &str) -> Result<Self, crate::error::ClientError> {
        serde_json::from_str(line)
            .map_err(|e| crate::error::ClientError::MalformedPayload(e.to_string()))
    }

    /// Resolve this submission into an insertable [`Job`], applying the
    /// supplied default `max_retries` (from `Config`) when the submission
    /// omitted one.
    pub fn into_job(self, default_max_retries: i64) -> Result<Job, crate::error::ClientError> {
        if self.id.is_empty() {
            return Err(crate::error::ClientError::MalformedPayload(
                "id must not be empty".into(),
            ));
        }
        if self.command.is_empty() {
            return Err(crate::error::ClientError::MalformedPayload(
                "command must not be empty".into(),
            ));
        }
        if let Some(t) = self.timeout_seconds {
            if t <= 0 {
                return Err(crate::error::ClientError::MalformedPayload(
                    "timeout_seconds must be > 0".into(),
                ));
            }
        }
        if let Some(m) = self.max_retries {
            if m < 0 {
                return Err(crate::error::ClientError::MalformedPayload(
                    "max_retries must be >= 0".into(),
                ));
            }
        }

        let mut job = Job::new(self.id, self.command)
            .with_max_retries(self.max_retries.unwrap_or(default_max_retries));
        if let Some(priority) = self.priority {
            job = job.with_priority(priority);
        }
        if let Some(run_at) = self.run_at {
            job = job.with_run_at(run_at);
        }
        if let Some(timeout_seconds) = self.timeout_seconds {
            job = job.with_timeout_seconds(timeout_seconds);
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_defaults() {
        let job = Job::new("a", "true");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.priority, 0);
        assert_eq!(job.run_at, None);
        assert_eq!(job.effective_timeout_seconds(), DEFAULT_TIMEOUT_SECONDS);
    }

    #[test]
    fn effective_timeout_respects_override() {
        let job = Job::new("a", "true").with_timeout_seconds(30);
        assert_eq!(job.effective_timeout_seconds(), 30);
    }

    #[test]
    fn is_eligible_true_when_run_at_absent() {
        let job = Job::new("a", "true");
        assert!(job.is_eligible(Utc::now()));
    }

    #[test]
    fn is_eligible_false_before_run_at() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        let job = Job::new("a", "true").with_run_at(future);
        assert!(!job.is_eligible(Utc::now()));
    }

    #[test]
    fn is_eligible_true_after_run_at() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        let job = Job::new("a", "true").with_run_at(past);
        assert!(job.is_eligible(Utc::now()));
    }

    #[test]
    fn is_eligible_false_when_not_pending() {
        let mut job = Job::new("a", "true");
        job.state = JobState::Processing;
        assert!(!job.is_eligible(Utc::now()));
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ] {
            let parsed: JobState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn submission_rejects_unknown_fields() {
        let raw = r#"{"id":"a","command":"true","bogus":1}"#;
        let err = serde_json::from_str::<JobSubmission>(raw).unwrap_err();
        assert!(err.to_string().contains("bogus") || err.is_data());
    }

    #[test]
    fn parse_line_rejects_unknown_fields() {
        let err = JobSubmission::parse_line(r#"{"id":"a","command":"true","bogus":1}"#).unwrap_err();
        assert!(matches!(err, crate::error::ClientError::MalformedPayload(_)));
    }

    #[test]
    fn parse_line_then_into_job_round_trips() {
        let submission = JobSubmission::parse_line(r#"{"id":"a","command":"true","priority":5}"#).unwrap();
        let job = submission.into_job(3).unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.priority, 5);
    }

    #[test]
    fn submission_into_job_applies_default_max_retries() {
        let raw = r#"{"id":"a","command":"true"}"#;
        let submission: JobSubmission = serde_json::from_str(raw).unwrap();
        let job = submission.into_job(3).unwrap();
        assert_eq!(job.max_retries, 3);
    }

    #[test]
    fn submission_into_job_rejects_empty_id() {
        let submission = JobSubmission {
            id: String::new(),
            command: "true".into(),
            max_retries: None,
            priority: None,
            run_at: None,
            timeout_seconds: None,
        };
        assert!(submission.into_job(3).is_err());
    }
}
