//! Batch outcome aggregation
//!
//! Collects the outcome of every submitted task and exposes the batch to
//! the caller as a single joined result: a complete per-task outcome map
//! plus one combined error presenting every failure, not just the first.
//! Outcomes accumulate in completion order behind a single short-lived
//! lock; recording never blocks on slow consumers.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::task::{Outcome, TaskError, TaskId};

/// Joined error over every failed task in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    failures: Vec<(TaskId, TaskError)>,
}

impl BatchError {
    /// Every failure in the batch, sorted by task ID
    pub fn failures(&self) -> &[(TaskId, TaskError)] {
        &self.failures
    }

    /// Number of failed tasks
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether the batch had no failures (never true for a returned error)
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} task(s) failed", self.failures.len())?;
        for (id, err) in &self.failures {
            write!(f, "; {id}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// Aggregate result of one batch
pub struct BatchResult<T> {
    /// Outcome of every submitted task, success and failure alike
    pub outcomes: HashMap<TaskId, Outcome<T>>,

    /// Joined error over all failures, `None` when everything succeeded
    pub error: Option<BatchError>,
}

impl<T> BatchResult<T> {
    /// Whether every task in the batch succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct AggregatorInner<T> {
    outcomes: HashMap<TaskId, Outcome<T>>,
    pending: HashSet<TaskId>,
    submitted: usize,
}

/// Thread-safe outcome collector for the current batch
///
/// A batch covers everything submitted on the owning pool instance; the
/// submitted and recorded counters are monotonic.
pub struct OutcomeAggregator<T> {
    inner: Mutex<AggregatorInner<T>>,
    notify: Notify,
}

impl<T> OutcomeAggregator<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AggregatorInner {
                outcomes: HashMap::new(),
                pending: HashSet::new(),
                submitted: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Register an accepted submission
    pub fn task_submitted(&self, id: TaskId) {
        let mut inner = self.inner.lock();
        inner.submitted += 1;
        inner.pending.insert(id);
    }

    /// Roll back a registration whose enqueue was rejected
    ///
    /// The rollback can complete the batch: a waiter that sampled the
    /// counters between registration and rollback must be woken, exactly
    /// as if an outcome had been recorded.
    pub fn submission_failed(&self, id: TaskId) {
        let complete = {
            let mut inner = self.inner.lock();
            if inner.pending.remove(&id) {
                inner.submitted -= 1;
            }
            inner.outcomes.len() >= inner.submitted
        };
        if complete {
            self.notify.notify_waiters();
        }
    }

    /// Record one task's outcome; the first write for an ID wins
    ///
    /// A late completion arriving after the task was abandoned at forced
    /// shutdown is ignored rather than double-counted.
    pub fn record(&self, id: TaskId, outcome: Outcome<T>) {
        let complete = {
            let mut inner = self.inner.lock();
            if inner.outcomes.contains_key(&id) {
                debug!(task = %id, "outcome already recorded, ignoring");
                return;
            }
            inner.pending.remove(&id);
            inner.outcomes.insert(id, outcome);
            inner.outcomes.len() >= inner.submitted
        };
        if complete {
            self.notify.notify_waiters();
        }
    }

    /// Number of accepted submissions so far
    pub fn submitted_count(&self) -> usize {
        self.inner.lock().submitted
    }

    /// Number of recorded outcomes so far
    pub fn recorded_count(&self) -> usize {
        self.inner.lock().outcomes.len()
    }

    /// Block until every accepted submission has a recorded outcome
    pub async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock();
                if inner.outcomes.len() >= inner.submitted {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Record a cancellation outcome for every task still without one
    ///
    /// Used by the shutdown coordinator once the grace period has elapsed.
    /// Returns the abandoned task IDs, sorted.
    pub fn abandon_incomplete(&self) -> Vec<TaskId> {
        let abandoned = {
            let mut inner = self.inner.lock();
            let mut ids: Vec<TaskId> = inner.pending.drain().collect();
            ids.sort();
            for id in &ids {
                inner.outcomes.insert(*id, Err(TaskError::Cancelled));
            }
            ids
        };
        if !abandoned.is_empty() {
            self.notify.notify_waiters();
        }
        abandoned
    }
}

impl<T: Clone> OutcomeAggregator<T> {
    /// Wait for the batch to complete and return the joined result
    pub async fn wait(&self) -> BatchResult<T> {
        self.drained().await;

        let inner = self.inner.lock();
        let outcomes = inner.outcomes.clone();
        let mut failures: Vec<(TaskId, TaskError)> = outcomes
            .iter()
            .filter_map(|(id, outcome)| outcome.as_ref().err().map(|e| (*id, e.clone())))
            .collect();
        failures.sort_by_key(|(id, _)| *id);

        let error = if failures.is_empty() {
            None
        } else {
            Some(BatchError { failures })
        };
        BatchResult { outcomes, error }
    }
}

impl<T> Default for OutcomeAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_empty_batch_completes_immediately() {
        let agg: OutcomeAggregator<u32> = OutcomeAggregator::new();
        let result = agg.wait().await;
        assert!(result.outcomes.is_empty());
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_recorded() {
        let agg: Arc<OutcomeAggregator<u32>> = Arc::new(OutcomeAggregator::new());
        let a = TaskId::now_v7();
        let b = TaskId::now_v7();
        agg.task_submitted(a);
        agg.task_submitted(b);
        agg.record(a, Ok(1));

        let waiter = {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move { agg.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        agg.record(b, Ok(2));
        let result = waiter.await.unwrap();
        assert_eq!(result.outcomes.len(), 2);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_joined_error_enumerates_every_failure() {
        let agg: OutcomeAggregator<u32> = OutcomeAggregator::new();
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::now_v7()).collect();
        for id in &ids {
            agg.task_submitted(*id);
        }
        agg.record(ids[0], Ok(1));
        agg.record(ids[1], Err(TaskError::Execution("db timeout".into())));
        agg.record(ids[2], Err(TaskError::CircuitOpen));

        let result = agg.wait().await;
        assert_eq!(result.outcomes.len(), 3);

        let error = result.error.unwrap();
        assert_eq!(error.len(), 2);
        let message = error.to_string();
        assert!(message.starts_with("2 task(s) failed"));
        assert!(message.contains("db timeout"));
        assert!(message.contains("circuit breaker rejected admission"));
    }

    #[tokio::test]
    async fn test_first_recorded_outcome_wins() {
        let agg: OutcomeAggregator<u32> = OutcomeAggregator::new();
        let id = TaskId::now_v7();
        agg.task_submitted(id);
        agg.record(id, Ok(1));
        agg.record(id, Err(TaskError::Cancelled));

        let result = agg.wait().await;
        assert_eq!(result.outcomes[&id], Ok(1));
    }

    #[tokio::test]
    async fn test_submission_rollback() {
        let agg: OutcomeAggregator<u32> = OutcomeAggregator::new();
        let id = TaskId::now_v7();
        agg.task_submitted(id);
        agg.submission_failed(id);
        assert_eq!(agg.submitted_count(), 0);

        // The rolled-back task does not block batch completion
        let result = agg.wait().await;
        assert!(result.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_wakes_blocked_waiters() {
        let agg: Arc<OutcomeAggregator<u32>> = Arc::new(OutcomeAggregator::new());
        let done = TaskId::now_v7();
        let rejected = TaskId::now_v7();
        agg.task_submitted(done);
        agg.record(done, Ok(1));
        agg.task_submitted(rejected);

        // Waiter samples the counters while the rejected submission is
        // still registered
        let waiter = {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move { agg.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        agg.submission_failed(rejected);
        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("rollback must complete the batch")
            .unwrap();
        assert_eq!(result.outcomes.len(), 1);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_abandon_incomplete_records_cancellations() {
        let agg: OutcomeAggregator<u32> = OutcomeAggregator::new();
        let done = TaskId::now_v7();
        let stuck = TaskId::now_v7();
        agg.task_submitted(done);
        agg.task_submitted(stuck);
        agg.record(done, Ok(9));

        let abandoned = agg.abandon_incomplete();
        assert_eq!(abandoned, vec![stuck]);

        let result = agg.wait().await;
        assert_eq!(result.outcomes[&stuck], Err(TaskError::Cancelled));
        assert_eq!(result.outcomes[&done], Ok(9));

        // A completion straggling in after abandonment is ignored
        agg.record(stuck, Ok(1));
        assert_eq!(agg.wait().await.outcomes[&stuck], Err(TaskError::Cancelled));
    }
}
