//! The Worker pool & registry (`# 4.6`): spawns N worker loops sharing one
//! Store, one shutdown signal, and a configuration snapshot captured at
//! start; coordinates graceful stop with a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::store::JobStore;
use crate::worker::Worker;

/// Grace period the pool waits for in-flight jobs to finish after a
/// shutdown signal before abandoning them to the Reaper (`# 4.6`).
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub worker_count: usize,
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            worker_count: 1,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl PoolConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }
}

/// Spawns and supervises N [`Worker`] loops over one shared Store.
///
/// The `handles` map is a purely in-process bookkeeping aid for join/await
/// during shutdown; it is not the authoritative worker registry described
/// in `# 3` (that's `Store::list_workers`, populated by each worker's own
/// heartbeat calls) — this map just lets the pool find its own task handles
/// without threading them through a separate `Vec` per call site.
pub struct WorkerPool<S: JobStore> {
    store: Arc<S>,
    config: Config,
    pool_config: PoolConfig,
    shutdown: CancellationToken,
    handles: DashMap<String, JoinHandle<()>>,
}

impl<S: JobStore + 'static> WorkerPool<S> {
    pub fn new(store: Arc<S>, config: Config, pool_config: PoolConfig) -> Self {
        WorkerPool {
            store,
            config,
            pool_config,
            shutdown: CancellationToken::new(),
            handles: DashMap::new(),
        }
    }

    /// Spawn `pool_config.worker_count` worker loops, each with a distinct
    /// id `worker-{n}`, all sharing this pool's shutdown token and the
    /// config snapshot captured at construction.
    pub fn start(&self) {
        for n in 0..self.pool_config.worker_count {
            let id = format!("worker-{n}");
            let worker = Worker::new(id.clone(), self.store.clone(), self.config, self.shutdown.clone());
            let handle = tokio::spawn(worker.run());
            self.handles.insert(id, handle);
        }
        info!(workers = self.pool_config.worker_count, "worker pool started");
    }

    /// A handle other components can use to request shutdown independent
    /// of the pool itself (e.g. a signal handler in the demonstration
    /// binary).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Broadcast cancellation and wait for every worker to finish its
    /// currently-executing job, up to `shutdown_grace`. Workers still
    /// claimed past the grace period are left `processing` for the next
    /// live pool's Reaper to recover (`# 4.6`).
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<JoinHandle<()>> = ids
            .iter()
            .filter_map(|id| self.handles.remove(id).map(|(_, h)| h))
            .collect();

        match tokio::time::timeout(self.pool_config.shutdown_grace, futures::future::join_all(handles)).await {
            Ok(results) => {
                for (id, result) in ids.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(worker_id = %id, error = %e, "worker task panicked");
                    }
                }
            }
            Err(_) => {
                warn!("shutdown grace period elapsed; remaining in-flight workers abandoned to the reaper");
            }
        }
        info!("worker pool stopped");
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> Config {
        self.config
    }
}
