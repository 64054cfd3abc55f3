//! End-to-end scenarios for the task pool: adaptive scaling, circuit
//! breaker gating, and graceful/forced shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor::{
    BreakerConfig, CircuitState, PoolConfig, ShutdownError, SubmitError, TaskError, TaskFn,
    TaskId, TaskPool,
};

/// Breaker that never trips, for tests about other components.
fn quiet_breaker() -> BreakerConfig {
    BreakerConfig::default().with_min_samples(1000)
}

/// Submit with retry on backpressure, the way callers are expected to
/// react to a full queue.
async fn submit_until_accepted<T, F>(pool: &TaskPool<T>, make: F) -> TaskId
where
    T: Send + 'static,
    F: Fn() -> TaskFn<T>,
{
    loop {
        match pool.submit(make()) {
            Ok(id) => return id,
            Err(SubmitError::QueueFull) => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(err) => panic!("unexpected submit error: {err}"),
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_twenty_tasks_scale_above_minimum() {
    let pool: TaskPool<u32> = TaskPool::new(
        PoolConfig::default()
            .with_worker_bounds(2, 4)
            .with_queue_capacity(10)
            .with_scale_check_interval(Duration::from_millis(10))
            .with_breaker(quiet_breaker()),
    )
    .unwrap();

    for _ in 0..20 {
        submit_until_accepted(&pool, || {
            TaskFn::new(|_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(1)
            })
        })
        .await;
    }

    let batch = pool.wait().await;
    assert!(batch.is_success());
    assert_eq!(batch.outcomes.len(), 20);
    assert!(batch.outcomes.values().all(|outcome| outcome == &Ok(1)));

    // The backlog pushed the pool above its minimum at some point.
    assert!(
        pool.peak_worker_count() > 2,
        "pool never scaled above min_workers (peak {})",
        pool.peak_worker_count()
    );
    assert!(pool.peak_worker_count() <= 4);

    assert_eq!(pool.shutdown(Duration::from_secs(1)).await, Ok(()));
}

#[tokio::test]
async fn test_breaker_opens_after_failures_and_fast_fails() {
    // Single worker so outcomes land in submission order.
    let pool: TaskPool<u32> = TaskPool::new(
        PoolConfig::default()
            .with_worker_bounds(1, 1)
            .with_queue_capacity(10)
            .with_breaker(
                BreakerConfig::default()
                    .with_failure_ratio(0.5)
                    .with_min_samples(4)
                    .with_open_duration(Duration::from_secs(30)),
            ),
    )
    .unwrap();

    for _ in 0..4 {
        pool.submit_fn(|_| async { Err(anyhow::anyhow!("dependency down")) })
            .unwrap();
    }
    let batch = pool.wait().await;
    assert_eq!(batch.outcomes.len(), 4);
    assert_eq!(pool.breaker_state(), CircuitState::Open);

    // The fifth task is rejected without its body ever running.
    let invoked = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&invoked);
    let fifth = pool
        .submit_fn(move |_| async move {
            probe.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        })
        .unwrap();

    let batch = pool.wait().await;
    assert_eq!(batch.outcomes.len(), 5);
    assert_eq!(batch.outcomes[&fifth], Err(TaskError::CircuitOpen));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    let error = batch.error.expect("batch has failures");
    assert_eq!(error.len(), 5);
}

#[tokio::test]
async fn test_half_open_trial_success_closes_circuit() {
    let pool: TaskPool<u32> = TaskPool::new(
        PoolConfig::default()
            .with_worker_bounds(1, 1)
            .with_breaker(
                BreakerConfig::default()
                    .with_failure_ratio(0.5)
                    .with_min_samples(2)
                    .with_trial_count(1)
                    .with_open_duration(Duration::from_millis(50)),
            ),
    )
    .unwrap();

    for _ in 0..2 {
        pool.submit_fn(|_| async { Err(anyhow::anyhow!("nope")) })
            .unwrap();
    }
    pool.wait().await;
    assert_eq!(pool.breaker_state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let trial = pool.submit_fn(|_| async { Ok(42) }).unwrap();
    let batch = pool.wait().await;
    assert_eq!(batch.outcomes[&trial], Ok(42));
    assert_eq!(pool.breaker_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_half_open_trial_failure_reopens_circuit() {
    let pool: TaskPool<u32> = TaskPool::new(
        PoolConfig::default()
            .with_worker_bounds(1, 1)
            .with_breaker(
                BreakerConfig::default()
                    .with_failure_ratio(0.5)
                    .with_min_samples(2)
                    .with_trial_count(1)
                    .with_open_duration(Duration::from_millis(50)),
            ),
    )
    .unwrap();

    for _ in 0..2 {
        pool.submit_fn(|_| async { Err(anyhow::anyhow!("nope")) })
            .unwrap();
    }
    pool.wait().await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let trial = pool
        .submit_fn(|_| async { Err(anyhow::anyhow!("still down")) })
        .unwrap();
    let batch = pool.wait().await;
    assert!(matches!(
        batch.outcomes[&trial],
        Err(TaskError::Execution(_))
    ));
    assert_eq!(pool.breaker_state(), CircuitState::Open);

    // Timer restarted: the next admission is rejected outright.
    let rejected = pool.submit_fn(|_| async { Ok(0) }).unwrap();
    let batch = pool.wait().await;
    assert_eq!(batch.outcomes[&rejected], Err(TaskError::CircuitOpen));
}

#[tokio::test]
async fn test_forced_shutdown_reports_stragglers_in_time() {
    let pool: TaskPool<u32> = TaskPool::new(
        PoolConfig::default()
            .with_worker_bounds(1, 1)
            .with_breaker(quiet_breaker()),
    )
    .unwrap();

    // Ignores its cancellation token entirely.
    let stuck = pool
        .submit_fn(|_| async {
            std::future::pending::<()>().await;
            Ok(0)
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let result = pool.shutdown(Duration::from_millis(100)).await;
    let elapsed = started.elapsed();

    assert_eq!(
        result,
        Err(ShutdownError::Forced {
            incomplete: vec![stuck]
        })
    );
    // Grace period plus the bounded cooperative-exit wait, not forever.
    assert!(elapsed < Duration::from_secs(2), "shutdown took {elapsed:?}");

    // The batch still resolves with a complete outcome map.
    let batch = pool.wait().await;
    assert_eq!(batch.outcomes[&stuck], Err(TaskError::Cancelled));
}

#[tokio::test]
async fn test_forced_cancel_with_cooperative_task_ends_clean() {
    let pool: TaskPool<u32> = TaskPool::new(
        PoolConfig::default()
            .with_worker_bounds(1, 1)
            .with_breaker(quiet_breaker()),
    )
    .unwrap();

    // Would run for ten seconds, but honors its token.
    let id = pool
        .submit_fn(|cancel| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(1),
                _ = cancel.cancelled() => Ok(99),
            }
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The grace period elapses, but the task exits within the bounded
    // post-cancellation window, so the shutdown is not forced.
    assert_eq!(pool.shutdown(Duration::from_millis(50)).await, Ok(()));

    let batch = pool.wait().await;
    assert_eq!(batch.outcomes[&id], Ok(99));
}

#[tokio::test]
async fn test_mixed_batch_returns_peers_and_joined_error() {
    let pool: TaskPool<u32> =
        TaskPool::new(PoolConfig::default().with_breaker(quiet_breaker())).unwrap();

    let ok = pool.submit_fn(|_| async { Ok(7) }).unwrap();
    let bad = pool
        .submit_fn(|_| async { Err(anyhow::anyhow!("record not found")) })
        .unwrap();

    let batch = pool.wait().await;
    assert_eq!(batch.outcomes.len(), 2);
    assert_eq!(batch.outcomes[&ok], Ok(7));
    assert!(matches!(batch.outcomes[&bad], Err(TaskError::Execution(_))));

    let error = batch.error.expect("one failure");
    assert_eq!(error.len(), 1);
    assert!(error.to_string().contains("record not found"));
}

#[tokio::test]
async fn test_queued_tasks_complete_during_graceful_drain() {
    let pool: TaskPool<u32> = TaskPool::new(
        PoolConfig::default()
            .with_worker_bounds(1, 1)
            .with_queue_capacity(10)
            .with_breaker(quiet_breaker()),
    )
    .unwrap();

    for _ in 0..5 {
        pool.submit_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(1)
        })
        .unwrap();
    }

    assert_eq!(pool.shutdown(Duration::from_secs(2)).await, Ok(()));

    let batch = pool.wait().await;
    assert_eq!(batch.outcomes.len(), 5);
    assert!(batch.is_success());
}
