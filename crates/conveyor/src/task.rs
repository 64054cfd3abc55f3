//! Task unit and per-task outcome types
//!
//! A [`Task`] is the engine's unit of work: one cancellable execution that
//! produces a value or a typed failure. Cancellation is cooperative - the
//! engine signals the [`CancellationToken`] it hands to [`Task::execute`] and
//! expects long-running work to poll it; it never force-stops a running task.

use std::any::Any;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique task identifier (caller-supplied or generated at submission)
pub type TaskId = Uuid;

/// The result of one task execution - a success value or a typed failure
pub type Outcome<T> = Result<T, TaskError>;

/// Failure kinds recorded as task outcomes
///
/// Failures are local to the task that produced them: they are recorded in
/// the batch aggregator and never abort the pool or other tasks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The circuit breaker denied admission; the task body was never invoked.
    ///
    /// Excluded from breaker failure statistics so a rejection storm cannot
    /// keep the circuit open on its own.
    #[error("circuit breaker rejected admission")]
    CircuitOpen,

    /// The task's own execution function returned an error
    #[error("task execution failed: {0}")]
    Execution(String),

    /// The task panicked; the panic payload is captured and the worker
    /// that ran it survives
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was abandoned when the shutdown grace period elapsed
    #[error("task cancelled during shutdown")]
    Cancelled,
}

impl TaskError {
    /// Convert a caught panic payload into a task failure
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Self::Panicked(message)
    }

    /// Whether this failure came from the circuit breaker rather than
    /// from executing the task
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }
}

/// A unit of work executed by the pool
///
/// Implementations must poll or select on the cancellation token at
/// reasonable intervals if the work is long-running. Ignoring the token is
/// a caller bug: the engine will still report the task as incomplete at
/// forced shutdown, but it cannot interrupt the underlying execution.
#[async_trait]
pub trait Task: Send {
    /// Value produced on success
    type Output: Send + 'static;

    /// Identifier for this task; `None` lets the pool generate one
    fn id(&self) -> Option<TaskId> {
        None
    }

    /// Run the task to completion or until the token is cancelled
    async fn execute(&mut self, cancel: CancellationToken) -> anyhow::Result<Self::Output>;
}

type ExecFn<T> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Adapter that turns an async closure into a [`Task`]
///
/// # Example
///
/// ```ignore
/// let task = TaskFn::new(|cancel| async move {
///     tokio::select! {
///         _ = cancel.cancelled() => anyhow::bail!("interrupted"),
///         _ = do_work() => Ok(42),
///     }
/// });
/// pool.submit(task)?;
/// ```
pub struct TaskFn<T> {
    id: Option<TaskId>,
    exec: Option<ExecFn<T>>,
}

impl<T: Send + 'static> TaskFn<T> {
    /// Wrap an async closure taking the cancellation token
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            id: None,
            exec: Some(Box::new(move |cancel| Box::pin(f(cancel)))),
        }
    }

    /// Use a caller-supplied identifier instead of a generated one
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }
}

#[async_trait]
impl<T: Send + 'static> Task for TaskFn<T> {
    type Output = T;

    fn id(&self) -> Option<TaskId> {
        self.id
    }

    async fn execute(&mut self, cancel: CancellationToken) -> anyhow::Result<T> {
        match self.exec.take() {
            Some(exec) => exec(cancel).await,
            None => Err(anyhow::anyhow!("task has already been executed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_str() {
        let err = TaskError::from_panic(Box::new("boom"));
        assert_eq!(err, TaskError::Panicked("boom".to_string()));
    }

    #[test]
    fn test_panic_payload_string() {
        let err = TaskError::from_panic(Box::new("kapow".to_string()));
        assert_eq!(err, TaskError::Panicked("kapow".to_string()));
    }

    #[test]
    fn test_panic_payload_opaque() {
        let err = TaskError::from_panic(Box::new(7usize));
        assert_eq!(err, TaskError::Panicked("opaque panic payload".to_string()));
    }

    #[test]
    fn test_breaker_rejection_classification() {
        assert!(TaskError::CircuitOpen.is_breaker_rejection());
        assert!(!TaskError::Execution("x".into()).is_breaker_rejection());
        assert!(!TaskError::Cancelled.is_breaker_rejection());
    }

    #[tokio::test]
    async fn test_task_fn_executes_once() {
        let mut task = TaskFn::new(|_cancel| async move { Ok(5u32) });
        assert!(task.id().is_none());

        let first = task.execute(CancellationToken::new()).await;
        assert_eq!(first.unwrap(), 5);

        let second = task.execute(CancellationToken::new()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_task_fn_caller_supplied_id() {
        let id = TaskId::now_v7();
        let task = TaskFn::new(|_cancel| async move { Ok(()) }).with_id(id);
        assert_eq!(task.id(), Some(id));
    }

    #[tokio::test]
    async fn test_task_fn_observes_cancellation() {
        let mut task = TaskFn::new(|cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Ok("stopped")
        });

        let token = CancellationToken::new();
        token.cancel();
        let result = task.execute(token).await;
        assert_eq!(result.unwrap(), "stopped");
    }
}
