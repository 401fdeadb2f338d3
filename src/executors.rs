//! Bounded per-server worker pools.
//!
//! Each managed server gets one query pool and one result pool. A pool is a
//! single worker task fed by a bounded queue; admission is `try_send`, so a
//! full queue rejects the submission instead of blocking the scheduler. That
//! rejection is the engine's only backpressure mechanism: a dropped tick is
//! preferable to a growing backlog of stale samples.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::{IntGauge, Opts, Registry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::model::Server;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How long `shutdown` waits for a pool's worker to drain.
pub const POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default queue bound for both pool roles.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Which half of the pipeline a pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    Query,
    Result,
}

impl PoolRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolRole::Query => "query",
            PoolRole::Result => "result",
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The queue is at capacity.
    QueueFull,
    /// The pool has been shut down.
    Shutdown,
}

/// Observability facade for one pool: gauges registered with the agent's
/// metric registry, named by role and server identity.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    queued: IntGauge,
    active: IntGauge,
    capacity: IntGauge,
}

impl PoolMetrics {
    fn new(role: PoolRole, server_key: &str, capacity: usize) -> Self {
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(
                Opts::new(name, help)
                    .const_label("role", role.as_str())
                    .const_label("server", server_key),
            )
            .expect("valid gauge opts")
        };
        let metrics = Self {
            queued: gauge("beanpoll_pool_queued_tasks", "Tasks waiting in the pool queue"),
            active: gauge("beanpoll_pool_active_tasks", "Tasks currently executing"),
            capacity: gauge("beanpoll_pool_capacity", "Bound of the pool queue"),
        };
        metrics.capacity.set(capacity as i64);
        metrics
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.queued.clone()))?;
        registry.register(Box::new(self.active.clone()))?;
        registry.register(Box::new(self.capacity.clone()))?;
        Ok(())
    }

    pub fn unregister(&self, registry: &Registry) {
        let _ = registry.unregister(Box::new(self.queued.clone()));
        let _ = registry.unregister(Box::new(self.active.clone()));
        let _ = registry.unregister(Box::new(self.capacity.clone()));
    }

    pub fn queued(&self) -> i64 {
        self.queued.get()
    }

    pub fn active(&self) -> i64 {
        self.active.get()
    }
}

/// A single-worker pool with a bounded queue.
pub struct BoundedExecutor {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: PoolMetrics,
}

impl BoundedExecutor {
    pub fn new(role: PoolRole, server_key: &str, capacity: usize) -> Self {
        let name = format!("{}-{}", role.as_str(), server_key);
        let metrics = PoolMetrics::new(role, server_key, capacity);
        let (tx, mut rx) = mpsc::channel::<Task>(capacity);

        let queued = metrics.queued.clone();
        let active = metrics.active.clone();
        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                queued.dec();
                active.inc();
                task.await;
                active.dec();
            }
        });

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Submit a task without blocking. A full queue or a shut-down pool
    /// refuses the task; the caller decides what dropping it means.
    pub fn try_execute<F>(&self, task: F) -> Result<(), Rejection>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tx.lock().expect("executor submit lock");
        let Some(tx) = guard.as_ref() else {
            return Err(Rejection::Shutdown);
        };
        match tx.try_send(Box::pin(task)) {
            Ok(()) => {
                self.metrics.queued.inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(Rejection::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Rejection::Shutdown),
        }
    }

    /// Close the queue and wait up to `timeout` for queued work to drain.
    /// On timeout the worker is aborted and the overrun is logged.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tx.lock().expect("executor submit lock").take();
        let handle = self.worker.lock().expect("executor worker lock").take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(_) => debug!(pool = %self.name, "pool drained"),
                Err(_) => {
                    warn!(pool = %self.name, ?timeout, "pool did not drain in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// One bounded pool per server, for a single role.
pub struct ExecutorRepository {
    role: PoolRole,
    capacity: usize,
    pools: HashMap<String, Arc<BoundedExecutor>>,
}

impl ExecutorRepository {
    pub fn new(role: PoolRole, capacity: usize) -> Self {
        Self {
            role,
            capacity,
            pools: HashMap::new(),
        }
    }

    /// Create the pool for `server`. Replaces (and leaks the worker of) any
    /// previous pool for the same key, so callers clear the repository
    /// between configuration generations.
    pub fn put(&mut self, server: &Server) {
        let key = server.key();
        let executor = Arc::new(BoundedExecutor::new(self.role, &key, self.capacity));
        self.pools.insert(key, executor);
    }

    pub fn executor_for(&self, server: &Server) -> Option<Arc<BoundedExecutor>> {
        self.pools.get(&server.key()).cloned()
    }

    pub fn metrics(&self) -> Vec<PoolMetrics> {
        self.pools.values().map(|p| p.metrics().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Shut down every pool (bounded wait per pool) and discard them.
    pub async fn clear(&mut self) {
        for (_, pool) in self.pools.drain() {
            pool.shutdown(POOL_SHUTDOWN_TIMEOUT).await;
        }
    }
}
