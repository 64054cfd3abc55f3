//! Adaptive worker pool
//!
//! Executes queued tasks concurrently, scaling the number of workers
//! between the configured minimum and maximum based on observed backlog,
//! and consulting the circuit breaker before every execution attempt.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::{ConfigError, PoolConfig};
use super::lifecycle::{Lifecycle, PoolStatus, ShutdownError};
use crate::aggregator::{BatchResult, OutcomeAggregator};
use crate::breaker::{BreakerRejected, CircuitBreaker, CircuitState};
use crate::queue::{BoundedQueue, EnqueueError};
use crate::task::{Task, TaskError, TaskFn, TaskId};

/// Scale up when backlog exceeds this multiple of the worker count
const SCALE_UP_BACKLOG_FACTOR: usize = 2;
/// Scale down when backlog times this factor is below the worker count
const SCALE_DOWN_BACKLOG_FACTOR: usize = 2;

/// Submission rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The bounded queue has no capacity; retry later or shed load
    #[error("work queue is full")]
    QueueFull,

    /// Shutdown has begun; do not retry against this pool instance
    #[error("task pool is stopped")]
    PoolStopped,
}

struct QueuedTask<T> {
    id: TaskId,
    submitted_at: DateTime<Utc>,
    task: Box<dyn Task<Output = T>>,
}

struct PoolCounters {
    workers: AtomicUsize,
    peak_workers: AtomicUsize,
    next_worker_index: AtomicUsize,
    retire_requests: AtomicUsize,
}

impl PoolCounters {
    fn new() -> Self {
        Self {
            workers: AtomicUsize::new(0),
            peak_workers: AtomicUsize::new(0),
            next_worker_index: AtomicUsize::new(0),
            retire_requests: AtomicUsize::new(0),
        }
    }

    /// Consume one pending retirement request, if any
    fn take_retirement(&self) -> bool {
        self.retire_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct Shared<T: Send + 'static> {
    config: PoolConfig,
    queue: BoundedQueue<QueuedTask<T>>,
    breaker: CircuitBreaker,
    aggregator: OutcomeAggregator<T>,
    lifecycle: Lifecycle,
    counters: PoolCounters,
    /// Wakes one idle worker so a pending retirement is consumed without
    /// waiting for task traffic
    retire_notify: Notify,
}

/// Concurrent task execution engine
///
/// Combines the bounded work queue, the adaptive worker pool, the circuit
/// breaker and the batch aggregator behind one handle.
///
/// # Example
///
/// ```ignore
/// use conveyor::{PoolConfig, TaskPool};
/// use std::time::Duration;
///
/// let pool = TaskPool::new(PoolConfig::default().with_worker_bounds(2, 8))?;
///
/// for url in urls {
///     pool.submit_fn(move |cancel| async move { fetch(url, cancel).await })?;
/// }
///
/// let batch = pool.wait().await;
/// for (id, outcome) in &batch.outcomes {
///     // success and failure outcomes are peers
/// }
///
/// pool.shutdown(Duration::from_secs(5)).await?;
/// ```
pub struct TaskPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    scaler_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> TaskPool<T> {
    /// Construct a pool and immediately start `min_workers` workers
    ///
    /// Fails if the configuration is out of range; no background work is
    /// started in that case.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(config.queue_capacity),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            aggregator: OutcomeAggregator::new(),
            lifecycle: Lifecycle::new(),
            counters: PoolCounters::new(),
            retire_notify: Notify::new(),
            config,
        });

        for _ in 0..shared.config.min_workers {
            spawn_worker(&shared);
        }
        let scaler_handle = tokio::spawn(scaler_loop(Arc::clone(&shared)));

        info!(
            min_workers = shared.config.min_workers,
            max_workers = shared.config.max_workers,
            queue_capacity = shared.config.queue_capacity,
            "task pool started"
        );

        Ok(Self {
            shared,
            scaler_handle: parking_lot::Mutex::new(Some(scaler_handle)),
        })
    }

    /// Submit a task for execution
    ///
    /// Non-blocking: a full queue is reported immediately as
    /// [`SubmitError::QueueFull`] - that rejection is the backpressure
    /// signal, and callers are expected to slow down or shed load.
    pub fn submit(&self, task: impl Task<Output = T> + 'static) -> Result<TaskId, SubmitError> {
        if !self.shared.lifecycle.is_running() {
            return Err(SubmitError::PoolStopped);
        }

        let id = task.id().unwrap_or_else(TaskId::now_v7);
        let queued = QueuedTask {
            id,
            submitted_at: Utc::now(),
            task: Box::new(task),
        };

        // Register before enqueueing so a worker can never record an
        // outcome for a task the aggregator has not seen.
        self.shared.aggregator.task_submitted(id);
        match self.shared.queue.try_enqueue(queued) {
            Ok(()) => {
                debug!(task = %id, "task submitted");
                Ok(id)
            }
            Err(EnqueueError::Full) => {
                self.shared.aggregator.submission_failed(id);
                Err(SubmitError::QueueFull)
            }
            Err(EnqueueError::Closed) => {
                self.shared.aggregator.submission_failed(id);
                Err(SubmitError::PoolStopped)
            }
        }
    }

    /// Submit an async closure as a task
    pub fn submit_fn<F, Fut>(&self, f: F) -> Result<TaskId, SubmitError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit(TaskFn::new(f))
    }

    /// Block until every submitted task has an outcome, then return the
    /// complete per-task outcome map plus one joined error over all
    /// failures
    pub async fn wait(&self) -> BatchResult<T>
    where
        T: Clone,
    {
        self.shared.aggregator.wait().await
    }

    /// Shut the pool down gracefully
    ///
    /// Stops admission, lets queued and in-flight tasks complete within
    /// `grace`, then cancels stragglers' tokens, waits one bounded
    /// interval for cooperative exit, and stops regardless. A forced stop
    /// is reported, never silently swallowed. Idempotent: a second call
    /// returns the first call's result.
    #[instrument(skip(self), fields(grace_ms = grace.as_millis() as u64))]
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        if !self.shared.lifecycle.begin_drain() {
            debug!("shutdown already in progress");
            return self.shared.lifecycle.wait_stopped().await;
        }

        info!("draining task pool");
        self.shared.queue.close();

        let drained = tokio::time::timeout(grace, self.shared.aggregator.drained())
            .await
            .is_ok();

        let result = if drained {
            Ok(())
        } else {
            warn!("grace period elapsed, cancelling in-flight tasks");
            self.shared.lifecycle.force_cancel();

            let dropped = self.shared.queue.drain();
            if !dropped.is_empty() {
                debug!(count = dropped.len(), "dropped queued tasks");
            }
            drop(dropped);

            // Bounded wait for cooperative exit, then stop regardless.
            let _ = tokio::time::timeout(
                self.shared.config.force_poll_interval,
                self.shared.aggregator.drained(),
            )
            .await;

            let incomplete = self.shared.aggregator.abandon_incomplete();
            if incomplete.is_empty() {
                Ok(())
            } else {
                warn!(
                    count = incomplete.len(),
                    "tasks did not complete before forced stop"
                );
                Err(ShutdownError::Forced { incomplete })
            }
        };

        self.shared.lifecycle.mark_stopped(result.clone());
        info!("task pool stopped");
        result
    }

    /// Current lifecycle status
    pub fn status(&self) -> PoolStatus {
        self.shared.lifecycle.status()
    }

    /// Current number of active workers
    pub fn worker_count(&self) -> usize {
        self.shared.counters.workers.load(Ordering::SeqCst)
    }

    /// Highest worker count observed since construction
    pub fn peak_worker_count(&self) -> usize {
        self.shared.counters.peak_workers.load(Ordering::SeqCst)
    }

    /// Number of tasks currently buffered in the queue
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Current circuit breaker state
    pub fn breaker_state(&self) -> CircuitState {
        self.shared.breaker.state()
    }

    /// The pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

impl<T: Send + 'static> Drop for TaskPool<T> {
    fn drop(&mut self) {
        // Let workers drain out instead of leaking on an unclosed queue.
        self.shared.queue.close();
        if let Some(handle) = self.scaler_handle.lock().take() {
            handle.abort();
        }
    }
}

fn spawn_worker<T: Send + 'static>(shared: &Arc<Shared<T>>) {
    let index = shared.counters.next_worker_index.fetch_add(1, Ordering::Relaxed);
    let count = shared.counters.workers.fetch_add(1, Ordering::SeqCst) + 1;
    shared.counters.peak_workers.fetch_max(count, Ordering::SeqCst);

    let shared = Arc::clone(shared);
    tokio::spawn(worker_loop(shared, index));
}

async fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>, index: usize) {
    debug!(worker = index, "worker started");
    loop {
        if shared.counters.take_retirement() {
            debug!(worker = index, "worker retiring");
            break;
        }
        // A retirement notification interrupts an idle dequeue; the loop
        // re-checks the counter so exactly one worker consumes it.
        let queued = tokio::select! {
            item = shared.queue.dequeue() => match item {
                Some(queued) => queued,
                // Queue closed and fully drained.
                None => break,
            },
            _ = shared.retire_notify.notified() => continue,
        };
        execute_one(&shared, queued).await;
    }
    shared.counters.workers.fetch_sub(1, Ordering::SeqCst);
    debug!(worker = index, "worker exited");
}

async fn execute_one<T: Send + 'static>(shared: &Shared<T>, mut queued: QueuedTask<T>) {
    let id = queued.id;

    let permit = match shared.breaker.admit() {
        Ok(permit) => permit,
        Err(BreakerRejected) => {
            // Fast-fail without invoking the task body. Rejections are
            // recorded as outcomes but never fed back into the breaker.
            debug!(task = %id, "admission rejected, circuit open");
            shared.aggregator.record(id, Err(TaskError::CircuitOpen));
            return;
        }
    };

    let queued_ms = Utc::now()
        .signed_duration_since(queued.submitted_at)
        .num_milliseconds();
    debug!(task = %id, queued_ms, "task claimed");

    let cancel = shared.lifecycle.cancel_token().child_token();
    let result = AssertUnwindSafe(queued.task.execute(cancel))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(value)) => {
            permit.success();
            Ok(value)
        }
        Ok(Err(err)) => {
            permit.failure();
            debug!(task = %id, error = %err, "task failed");
            Err(TaskError::Execution(format!("{err:#}")))
        }
        Err(payload) => {
            // One misbehaving task must never take down the pool; the
            // panic stops at this boundary and the worker keeps going.
            permit.failure();
            let err = TaskError::from_panic(payload);
            warn!(task = %id, error = %err, "task panicked, worker recovered");
            Err(err)
        }
    };
    shared.aggregator.record(id, outcome);
}

async fn scaler_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    let mut ticker = tokio::time::interval(shared.config.scale_check_interval);
    let mut drain_rx = shared.lifecycle.drain_signal();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let depth = shared.queue.len();
                let workers = shared.counters.workers.load(Ordering::SeqCst);
                let retiring = shared.counters.retire_requests.load(Ordering::SeqCst);
                let effective = workers.saturating_sub(retiring);

                if depth > effective * SCALE_UP_BACKLOG_FACTOR
                    && effective < shared.config.max_workers
                {
                    info!(depth, workers = effective, "backlog high, adding worker");
                    spawn_worker(&shared);
                } else if effective > shared.config.min_workers
                    && depth * SCALE_DOWN_BACKLOG_FACTOR < effective
                {
                    debug!(depth, workers = effective, "backlog low, retiring one worker");
                    shared.counters.retire_requests.fetch_add(1, Ordering::SeqCst);
                    shared.retire_notify.notify_one();
                }
            }
            _ = drain_rx.changed() => break,
        }
    }
    debug!("scaler exited");
}
