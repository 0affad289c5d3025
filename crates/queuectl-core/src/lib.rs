//! # queuectl-core
//!
//! The durable scheduling engine at the heart of QueueCTL: the `Job` data
//! model and state machine, the backend-agnostic `JobStore` contract, the
//! pure retry/backoff policy, the command `Executor`, and the `Worker`
//! loop/pool/reaper that drive jobs from `pending` through to `completed`
//! or `dead`.
//!
//! This crate depends on no concrete database crate — `queuectl-sqlite`
//! provides the one backend this workspace ships. CLI plumbing, a web
//! dashboard, and a metrics sink are out of scope (`# 1`); they are
//! external collaborators against this crate's query and mutation surface.

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod pool;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{ClientError, StoreError};
pub use executor::{Executor, Outcome};
pub use job::{Job, JobState, JobSubmission, DEFAULT_TIMEOUT_SECONDS};
pub use pool::{PoolConfig, WorkerPool};
pub use reaper::Reaper;
pub use retry::Disposition;
pub use store::{JobStore, StateCounts, WorkerRegistration};
pub use worker::Worker;
