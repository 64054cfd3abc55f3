//! Adaptive worker pool and its lifecycle
//!
//! This module provides:
//! - [`TaskPool`] - Main pool handle: submit, wait, shutdown
//! - [`PoolConfig`] - Immutable pool configuration
//! - [`PoolStatus`] - `Running -> Draining -> Stopped` lifecycle
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TaskPool                             │
//! │                                                              │
//! │  submit ──► ┌──────────────┐      ┌────────────────────┐     │
//! │             │ BoundedQueue │ ◄─── │   Scaler (interval)│     │
//! │             │ (fail-fast)  │      │   2x / 0.5x policy │     │
//! │             └──────┬───────┘      └────────────────────┘     │
//! │                    │ dequeue (FIFO)                          │
//! │                    ▼                                         │
//! │  ┌───────────────────────────────────────────────────┐       │
//! │  │  Workers (min..=max)                              │       │
//! │  │  breaker.admit ─► execute ─► record outcome       │       │
//! │  └──────────┬───────────────────────────┬────────────┘       │
//! │             ▼                           ▼                    │
//! │      CircuitBreaker              OutcomeAggregator           │
//! │      (rolling window)            (batch map + joined error)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod lifecycle;
#[allow(clippy::module_inception)]
mod pool;

pub use config::{ConfigError, PoolConfig};
pub use lifecycle::{PoolStatus, ShutdownError};
pub use pool::{SubmitError, TaskPool};
