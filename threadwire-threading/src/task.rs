use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use threadwire_protocol::{TaskUid, TransferError, Value};
use tokio::sync::oneshot;

/// The reason a call was rejected.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The worker's method returned an error or panicked.
    ///
    /// Displays exactly the message reported by the worker.
    #[error("{0}")]
    Failed(String),
    /// The worker does not expose a method with this name.
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    /// The thread was terminated before the call completed.
    #[error("thread has been terminated")]
    Terminated,
    /// The worker went away before the call completed.
    #[error("worker disconnected")]
    Disconnected,
    /// The arguments could not be transferred.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// The call could not be sent to the worker.
    #[error("failed to send call: {0}")]
    Send(String),
}

/// The settlement state of a [`Task`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// The task has not been settled yet.
    Pending,
    /// The task was resolved with a value.
    Resolved,
    /// The task was rejected with an error.
    Rejected,
}

type TaskResult = Result<Value, CallError>;

#[derive(Debug)]
struct Settlement {
    state: TaskState,
    tx: Option<oneshot::Sender<TaskResult>>,
}

/// The settling half of a single call.
///
/// A task is settled at most once: only the first call to [`resolve`](Self::resolve) or
/// [`reject`](Self::reject) has an effect. Dropping a task that was never settled rejects it with
/// [`CallError::Terminated`], so no caller waits forever on a forgotten task.
#[derive(Debug)]
pub struct Task {
    uid: TaskUid,
    settlement: Arc<Mutex<Settlement>>,
}

impl Task {
    /// Creates a pending task with a fresh uid, and the handle its caller awaits.
    pub fn create() -> (Self, TaskHandle) {
        let uid = TaskUid::new();
        let (tx, rx) = oneshot::channel();

        let settlement = Arc::new(Mutex::new(Settlement {
            state: TaskState::Pending,
            tx: Some(tx),
        }));

        let result = rx
            .map(|result| result.unwrap_or(Err(CallError::Terminated)))
            .boxed()
            .shared();

        let task = Self {
            uid,
            settlement: Arc::clone(&settlement),
        };

        let handle = TaskHandle {
            uid,
            settlement,
            result,
        };

        (task, handle)
    }

    /// Returns the uid that correlates this task with its reply.
    pub fn uid(&self) -> TaskUid {
        self.uid
    }

    /// Returns the current settlement state.
    pub fn state(&self) -> TaskState {
        self.settlement.lock().state
    }

    /// Resolves the task. Returns `false` if it was already settled.
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    /// Rejects the task. Returns `false` if it was already settled.
    pub fn reject(&self, error: CallError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, result: TaskResult) -> bool {
        let mut settlement = self.settlement.lock();
        let Some(tx) = settlement.tx.take() else {
            return false;
        };

        settlement.state = match result {
            Ok(_) => TaskState::Resolved,
            Err(_) => TaskState::Rejected,
        };

        // Nobody may be waiting for the result anymore.
        tx.send(result).ok();
        true
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.reject(CallError::Terminated);
    }
}

/// The awaitable half of a single call.
///
/// Handles are cheap to clone, and all clones complete with the same result.
#[derive(Clone)]
#[must_use = "calls are not cancelled when their handle is dropped"]
pub struct TaskHandle {
    uid: TaskUid,
    settlement: Arc<Mutex<Settlement>>,
    result: Shared<BoxFuture<'static, TaskResult>>,
}

impl TaskHandle {
    /// Returns the uid of the call.
    pub fn uid(&self) -> TaskUid {
        self.uid
    }

    /// Returns the current settlement state.
    pub fn state(&self) -> TaskState {
        self.settlement.lock().state
    }

    /// Returns `true` once the task has been resolved or rejected.
    pub fn is_settled(&self) -> bool {
        self.state() != TaskState::Pending
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.result.poll_unpin(cx)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("uid", &self.uid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve() {
        let (task, handle) = Task::create();
        assert_eq!(task.uid(), handle.uid());
        assert_eq!(handle.state(), TaskState::Pending);

        assert!(task.resolve(Value::from("done")));

        assert!(handle.is_settled());
        assert_eq!(handle.await, Ok(Value::from("done")));
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let (task, handle) = Task::create();

        assert!(task.reject(CallError::Failed("boom".to_owned())));
        assert!(!task.resolve(Value::Int(1)));
        assert!(!task.reject(CallError::Terminated));

        assert_eq!(task.state(), TaskState::Rejected);
        assert_eq!(handle.await, Err(CallError::Failed("boom".to_owned())));
    }

    #[tokio::test]
    async fn test_clones_see_same_result() {
        let (task, handle) = Task::create();
        let other = handle.clone();

        task.resolve(Value::Int(7));

        assert_eq!(handle.await, Ok(Value::Int(7)));
        assert_eq!(other.await, Ok(Value::Int(7)));
    }

    #[tokio::test]
    async fn test_dropped_task_rejects() {
        let (task, handle) = Task::create();
        drop(task);

        assert_eq!(handle.state(), TaskState::Rejected);
        assert_eq!(handle.await, Err(CallError::Terminated));
    }

    #[test]
    fn test_failed_displays_worker_message() {
        let error = CallError::Failed("boom".to_owned());
        insta::assert_snapshot!(error, @"boom");
    }
}
