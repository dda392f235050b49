//! Bounded background executor
//!
//! Background work runs on a fixed set of worker tasks fed by a bounded
//! queue. [`TaskPool::submit`] never waits: when the queue is full the task
//! is handed back to the caller as rejected. [`TaskPool::submit_wait`] waits
//! for a free slot instead. The worker count bounds how many record-store
//! calls a pool can have in flight at once.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Unit of background work
pub type Task = BoxFuture<'static, ()>;

/// Why a task was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue at capacity
    QueueFull,
    /// Pool shut down
    Closed,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::QueueFull => write!(f, "task queue full"),
            SubmitError::Closed => write!(f, "task pool closed"),
        }
    }
}

/// In-flight bookkeeping shared with the workers
#[derive(Default)]
struct PoolState {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
    idle: Notify,
}

impl PoolState {
    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.discard();
    }

    /// Forget a task that will never run.
    fn discard(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Fixed-size worker pool with a bounded queue
pub struct TaskPool {
    sender: mpsc::Sender<Task>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<PoolState>,
    capacity: usize,
}

impl TaskPool {
    /// Start `workers` workers behind a queue of `capacity` tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(workers: usize, capacity: usize) -> Result<Self> {
        if workers == 0 || capacity == 0 {
            return Err(Error::Config(
                "task pool needs at least one worker and one queue slot".to_string(),
            ));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("task pool requires a Tokio runtime: {}", e)))?;

        let (sender, receiver) = mpsc::channel::<Task>(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();
        let state = Arc::new(PoolState::default());

        let handles = (0..workers)
            .map(|worker_id| {
                handle.spawn(run_worker(
                    worker_id,
                    receiver.clone(),
                    shutdown.clone(),
                    state.clone(),
                ))
            })
            .collect();

        info!(workers, capacity, "Task pool started");

        Ok(Self {
            sender,
            receiver,
            shutdown,
            workers: Mutex::new(handles),
            state,
            capacity,
        })
    }

    /// Queue a boxed task without waiting.
    pub fn submit(&self, task: Task) -> std::result::Result<(), SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::Closed);
        }
        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.discard();
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
                })
            }
        }
    }

    /// Queue a future without waiting.
    pub fn spawn<F>(&self, future: F) -> std::result::Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(future.boxed())
    }

    /// Queue a boxed task, waiting for a free slot while the queue is full.
    ///
    /// Fails only once the pool is shut down.
    pub async fn submit_wait(&self, task: Task) -> std::result::Result<(), SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::Closed);
        }
        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.sender.send(task).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.state.discard();
                Err(SubmitError::Closed)
            }
        }
    }

    /// Queue a future, waiting for a free slot while the queue is full.
    pub async fn spawn_wait<F>(&self, future: F) -> std::result::Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_wait(future.boxed()).await
    }

    /// Tasks queued or running
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Tasks that ran to completion (including panicked ones)
    pub fn completed(&self) -> u64 {
        self.state.completed.load(Ordering::Relaxed)
    }

    /// Tasks that panicked
    pub fn panicked(&self) -> u64 {
        self.state.panicked.load(Ordering::Relaxed)
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait until no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop the workers. Queued tasks that have not started are dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Task pool worker ended abnormally");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut dropped = 0usize;
        while let Ok(task) = receiver.try_recv() {
            drop(task);
            self.state.discard();
            dropped += 1;
        }
        info!(dropped, "Task pool stopped");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    shutdown: CancellationToken,
    state: Arc<PoolState>,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                task = receiver.recv() => task,
            }
        };

        let Some(task) = next else {
            debug!(worker_id, "Task pool worker exiting");
            return;
        };

        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            state.panicked.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, "Background task panicked");
        }
        state.finish();
    }
}
