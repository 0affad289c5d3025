//! A standalone binary driving `queuectl-core` + `queuectl-sqlite` end to
//! end, the way this codebase's own example binaries show a library driving
//! itself without the ceremony of the CLI/dashboard/metrics collaborators
//! it would eventually sit behind.
//!
//! Exercises the happy path, retry-then-DLQ, and priority-ordering
//! scenarios, then prints the drained state of every job it enqueued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use queuectl_core::job::Job;
use queuectl_core::pool::{PoolConfig, WorkerPool};
use queuectl_core::store::JobStore;
use queuectl_sqlite::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let db_path = queuectl_core::config::default_db_path();
    info!(db_path = %db_path, "opening store");
    let store = Arc::new(SqliteStore::connect(&db_path).await?);

    store.config_set("backoff-base", "1").await?;
    let config = store.config_snapshot().await?;
    info!(?config, "resolved worker config");

    seed_demo_jobs(store.as_ref()).await?;

    let pool = WorkerPool::new(store.clone(), config, PoolConfig::default().with_worker_count(2));
    pool.start();

    wait_for_drain(store.as_ref(), Duration::from_secs(30)).await?;

    pool.stop().await;

    report(store.as_ref(), "happy-path").await?;
    report(store.as_ref(), "retry-then-dlq").await?;
    report(store.as_ref(), "priority-lo").await?;
    report(store.as_ref(), "priority-hi").await?;

    Ok(())
}

async fn seed_demo_jobs(store: &SqliteStore) -> Result<()> {
    // S1: happy path.
    store.insert(Job::new("happy-path", "true")).await?;

    // S2: retries then DLQ. backoff-base=1 keeps the demo fast.
    store
        .insert(Job::new("retry-then-dlq", "false").with_max_retries(2))
        .await?;

    // S5: priority ordering. "priority-hi" is enqueued after "priority-lo"
    // but should claim first.
    store
        .insert(Job::new("priority-lo", "true").with_priority(0))
        .await?;
    store
        .insert(Job::new("priority-hi", "true").with_priority(10))
        .await?;

    Ok(())
}

async fn wait_for_drain(store: &SqliteStore, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let counts = store.counts_by_state().await?;
        if counts.is_drained() {
            info!(?counts, "drained");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for drain: {counts:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn report(store: &SqliteStore, id: &str) -> Result<()> {
    let job = store.get(id).await?;
    println!(
        "{id:>16}: state={:<10} attempts={:<3} error={}",
        job.state,
        job.attempts,
        job.error_message.as_deref().unwrap_or("-")
    );
    Ok(())
}
