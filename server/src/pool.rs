//! Bounded worker pool for chat ingress.
//!
//! The pool mirrors a classic core/queue/max executor:
//!
//! 1. `core` long-lived workers drain a bounded queue of `queue` jobs.
//! 2. When the queue is full, up to `max - core` burst tasks run jobs directly.
//! 3. Beyond that, submission fails immediately with [`PoolError::Saturated`].
//!
//! Submission never waits. Each job's result is delivered on a
//! [`oneshot`] channel, so callers choose whether to await it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Default number of long-lived workers.
pub const DEFAULT_CORE_WORKERS: usize = 10;

/// Default ceiling on concurrently running jobs.
pub const DEFAULT_MAX_WORKERS: usize = 50;

/// Default backlog depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Errors raised when submitting work.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Queue full and every burst slot in use.
    #[error("worker pool saturated")]
    Saturated,

    /// The pool's workers have stopped.
    #[error("worker pool closed")]
    Closed,
}

/// Sizing for a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub core: usize,
    pub max: usize,
    pub queue: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core: DEFAULT_CORE_WORKERS,
            max: DEFAULT_MAX_WORKERS,
            queue: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl From<&Config> for WorkerPoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            core: config.workers_core,
            max: config.workers_max,
            queue: config.worker_queue,
        }
    }
}

type Job = BoxFuture<'static, ()>;

/// Decrements the active counter even if the job panics.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed-core, bounded-burst task pool. Cloning shares the pool.
#[derive(Clone)]
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    burst: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Starts the core workers. Must be called inside a Tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let config = WorkerPoolConfig {
            core: config.core.max(1),
            max: config.max.max(config.core.max(1)),
            queue: config.queue.max(1),
        };

        let (sender, receiver) = mpsc::channel::<Job>(config.queue);
        let receiver = Arc::new(Mutex::new(receiver));

        for worker_id in 0..config.core {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    match job {
                        Some(job) => run_job(job).await,
                        None => break,
                    }
                }
                debug!(worker_id, "Worker stopped");
            });
        }

        info!(
            core = config.core,
            max = config.max,
            queue = config.queue,
            "Worker pool started"
        );

        Self {
            sender,
            burst: Arc::new(Semaphore::new(config.max - config.core)),
            active: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    pub fn config(&self) -> WorkerPoolConfig {
        self.config
    }

    /// Jobs currently executing.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the backlog.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Schedules `task` and returns a receiver for its output.
    ///
    /// The receiver errors if the task panics.
    ///
    /// # Errors
    ///
    /// [`PoolError::Saturated`] when no worker, queue slot or burst slot is
    /// free; [`PoolError::Closed`] if the workers are gone.
    pub fn submit<F, T>(&self, task: F) -> Result<oneshot::Receiver<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let active = Arc::clone(&self.active);
        let job: Job = async move {
            let _guard = ActiveGuard::enter(&active);
            let _ = tx.send(task.await);
        }
        .boxed();

        match self.sender.try_send(job) {
            Ok(()) => Ok(rx),
            Err(mpsc::error::TrySendError::Full(job)) => {
                let Ok(permit) = Arc::clone(&self.burst).try_acquire_owned() else {
                    warn!(
                        active = self.active_workers(),
                        queued = self.queued(),
                        "Worker pool saturated, rejecting job"
                    );
                    return Err(PoolError::Saturated);
                };
                debug!("Queue full, running job on burst task");
                tokio::spawn(async move {
                    run_job(job).await;
                    drop(permit);
                });
                Ok(rx)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PoolError::Closed),
        }
    }
}

/// Runs a job, keeping the calling worker alive if it panics.
async fn run_job(job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        warn!("Worker job panicked");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("active", &self.active_workers())
            .finish()
    }
}
