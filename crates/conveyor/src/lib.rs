//! # Conveyor
//!
//! A bounded, adaptive task execution engine.
//!
//! ## Features
//!
//! - **Bounded work queue**: fixed capacity, FIFO, fail-fast on overflow -
//!   backpressure is synchronous and visible to the caller, never hidden
//!   inside an unbounded buffer
//! - **Adaptive worker pool**: concurrency scales between configured
//!   min/max bounds driven by observed backlog
//! - **Circuit breaker**: stops wasting worker capacity on an operation
//!   class that is failing pervasively
//! - **Batch aggregation**: a complete per-task outcome map plus one
//!   joined error presenting every failure
//! - **Graceful shutdown**: drain within a grace period, then cancel
//!   cooperatively and report any stragglers instead of hanging
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskPool                             │
//! │  (submission, adaptive scaling, shutdown coordination)      │
//! └─────────────────────────────────────────────────────────────┘
//!           │                   │                    │
//!           ▼                   ▼                    ▼
//! ┌──────────────────┐ ┌────────────────┐ ┌───────────────────┐
//! │   BoundedQueue   │ │ CircuitBreaker │ │ OutcomeAggregator │
//! │ (fixed capacity) │ │ (admission)    │ │ (joined results)  │
//! └──────────────────┘ └────────────────┘ └───────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::{BreakerConfig, PoolConfig, TaskPool};
//! use std::time::Duration;
//!
//! let config = PoolConfig::default()
//!     .with_worker_bounds(2, 8)
//!     .with_queue_capacity(64)
//!     .with_breaker(BreakerConfig::default().with_failure_ratio(0.5));
//!
//! let pool = TaskPool::new(config)?;
//!
//! for item in items {
//!     pool.submit_fn(move |cancel| async move { process(item, cancel).await })?;
//! }
//!
//! let batch = pool.wait().await;
//! if let Some(error) = &batch.error {
//!     // every failure, not just the first
//!     eprintln!("{error}");
//! }
//!
//! pool.shutdown(Duration::from_secs(5)).await?;
//! ```
//!
//! Cancellation is cooperative throughout: tasks receive a
//! `CancellationToken` and are expected to poll it; the engine signals but
//! never force-stops a running task.

pub mod aggregator;
pub mod breaker;
pub mod pool;
pub mod queue;
pub mod task;

/// Prelude for common imports
pub mod prelude {
    pub use crate::aggregator::{BatchError, BatchResult};
    pub use crate::breaker::{BreakerConfig, CircuitState};
    pub use crate::pool::{PoolConfig, PoolStatus, ShutdownError, SubmitError, TaskPool};
    pub use crate::task::{Outcome, Task, TaskError, TaskFn, TaskId};
}

// Re-export key types at crate root
pub use aggregator::{BatchError, BatchResult, OutcomeAggregator};
pub use breaker::{
    BreakerConfig, BreakerConfigError, BreakerPermit, BreakerRejected, CircuitBreaker, CircuitState,
};
pub use pool::{ConfigError, PoolConfig, PoolStatus, ShutdownError, SubmitError, TaskPool};
pub use queue::{BoundedQueue, EnqueueError};
pub use task::{Outcome, Task, TaskError, TaskFn, TaskId};
