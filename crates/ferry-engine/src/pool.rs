//! Bounded worker pool with caller-runs backpressure.
//!
//! Submission follows a fixed order:
//! 1. Below `core_size` workers, start a core worker for the task.
//! 2. Otherwise enqueue it.
//! 3. If the queue is full and fewer than `max_size` workers exist, start an
//!    overflow worker for it. Overflow workers exit after `keep_alive` idle.
//! 4. If the queue is full and the pool is at `max_size`, the submitting
//!    caller runs the task itself.
//!
//! A pool with `core_size == 0` still starts one worker whenever a task is
//! queued and no worker is alive.
//!
//! No task is ever rejected or dropped while the pool is open.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span};

use crate::config::PoolConfig;
use crate::error::PoolError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Completion handle for a submitted task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task's output.
    pub async fn join(self) -> Result<T, PoolError> {
        self.rx.await.map_err(|_| PoolError::TaskLost)
    }
}

struct Shared {
    config: PoolConfig,
    queue_rx: AsyncMutex<mpsc::Receiver<Job>>,
    workers: AtomicUsize,
    next_id: AtomicUsize,
}

/// Worker pool for per-record creation work.
pub struct WorkerPool {
    shared: Arc<Shared>,
    queue_tx: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<JoinSet<()>>,
    shut_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                queue_rx: AsyncMutex::new(queue_rx),
                workers: AtomicUsize::new(0),
                next_id: AtomicUsize::new(1),
            }),
            queue_tx: Mutex::new(Some(queue_tx)),
            handles: Mutex::new(JoinSet::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Live worker count.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Submit a task. Resolves once the task is accepted, or after the caller
    /// has run it when the pool is saturated.
    pub async fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(task.await);
        });
        let handle = TaskHandle { rx };

        if self.shared.reserve(self.shared.config.core_size) {
            self.spawn_worker(Some(job), true)?;
            return Ok(handle);
        }

        let sender = self
            .queue_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::ShutDown)?;

        match sender.try_send(job) {
            Ok(()) => {
                if self.worker_count() == 0 && self.shared.reserve(self.shared.config.max_size.max(1)) {
                    self.spawn_worker(None, false)?;
                }
                Ok(handle)
            }
            Err(TrySendError::Full(job)) => {
                if self.shared.reserve(self.shared.config.max_size) {
                    self.spawn_worker(Some(job), false)?;
                } else {
                    debug!("worker pool saturated, running task on caller");
                    job.await;
                }
                Ok(handle)
            }
            Err(TrySendError::Closed(_)) => Err(PoolError::ShutDown),
        }
    }

    /// Stop accepting work and wait for queued and running tasks to finish.
    pub async fn shutdown(&self) {
        let mut handles = {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *handles)
        };
        self.queue_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        while handles.join_next().await.is_some() {}
        info!("worker pool drained");
    }

    /// Start a worker holding a reserved slot. The check against shutdown
    /// and the spawn share the `handles` lock with `shutdown`.
    fn spawn_worker(&self, first: Option<Job>, core: bool) -> Result<(), PoolError> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_shut_down() {
            self.shared.workers.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::ShutDown);
        }
        // Reap exited overflow workers.
        while handles.try_join_next().is_some() {}

        let shared = self.shared.clone();
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let span = info_span!("worker", name = %format!("{}{}", shared.config.name_prefix, id));
        debug!(id, core, "starting worker");

        handles.spawn(worker_loop(shared, first, core).instrument(span));
        Ok(())
    }
}

impl Shared {
    fn reserve(&self, limit: usize) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }
}

async fn worker_loop(shared: Arc<Shared>, first: Option<Job>, core: bool) {
    if let Some(job) = first {
        job.await;
    }

    loop {
        let recv = async { shared.queue_rx.lock().await.recv().await };
        let next = if core {
            recv.await
        } else {
            // Idle time includes waiting for the receiver lock.
            tokio::time::timeout(shared.config.keep_alive, recv)
                .await
                .ok()
                .flatten()
        };

        if let Some(job) = next {
            job.await;
            continue;
        }

        shared.workers.fetch_sub(1, Ordering::SeqCst);
        // A task queued while this worker timed out may have seen it as alive.
        if core
            || shared.queue_rx.lock().await.is_empty()
            || !shared.reserve(shared.config.max_size.max(1))
        {
            break;
        }
    }

    debug!(core, "worker exiting");
}
