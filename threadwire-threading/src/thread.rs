use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use threadwire_channel::{Channel, ChannelError, ControllerChannel, Receiver, Sender};
use threadwire_log::LogError;
use threadwire_protocol::{
    ControllerMessage, Payload, TaskUid, ThreadUid, Value, WorkerMessage, split_payloads,
};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::task::{CallError, Task, TaskHandle};

/// Default time a worker gets to announce its methods.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the error event stream of a thread.
const EVENT_CAPACITY: usize = 64;

/// Options for [`Thread::spawn`].
#[derive(Clone, Debug)]
pub struct ThreadOptions {
    /// Time the worker gets to send its init message.
    pub init_timeout: Duration,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// Errors raised while spawning a [`Thread`].
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The worker did not send its init message in time.
    #[error("did not receive an init message from worker within {0:?}")]
    Timeout(Duration),
    /// The worker reported an error instead of its init message.
    #[error("worker failed to initialize: {0}")]
    InitFailed(String),
    /// The worker sent another message before its init message.
    #[error("received {0} message from worker before init")]
    UnexpectedMessage(&'static str),
    /// The worker sent a message that could not be decoded before its init message.
    #[error("received malformed message from worker before init")]
    Malformed(#[source] ChannelError),
    /// The worker went away before sending its init message.
    #[error("worker disconnected before init")]
    Disconnected,
    /// The worker could not be started.
    #[error("failed to start worker")]
    Io(#[from] io::Error),
}

/// Errors raised by [`Thread::terminate`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TerminateError {
    /// The thread is already terminating or terminated.
    #[error("thread is already terminated")]
    AlreadyTerminated,
}

/// An error of a thread that is not tied to any call.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ThreadError {
    /// The worker reported an error outside of any call.
    #[error("uncaught error in worker: {0}")]
    Uncaught(String),
    /// The worker replied to a call that is not outstanding.
    #[error("received reply for unknown task {0}")]
    UnknownTask(TaskUid),
    /// The worker sent a message that could not be received, with the error chain.
    #[error("{0}")]
    Malformed(String),
    /// The worker went away while the thread was running.
    #[error("worker disconnected")]
    Disconnected,
}

/// The lifecycle state of a [`Thread`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Calls are accepted.
    Ready,
    /// The thread waits for outstanding calls before shutting down.
    Terminating,
    /// The worker has been shut down.
    Terminated,
    /// The worker went away without being terminated.
    Disconnected,
}

#[derive(Debug)]
struct Outstanding {
    task: Task,
    handle: TaskHandle,
}

#[derive(Debug)]
struct State {
    lifecycle: ThreadState,
    tasks: HashMap<TaskUid, Outstanding>,
}

/// State shared between a thread's handles and its dispatcher.
#[derive(Debug)]
struct Shared {
    uid: ThreadUid,
    state: Mutex<State>,
    events: broadcast::Sender<ThreadError>,
}

impl Shared {
    fn emit(&self, error: ThreadError) {
        match &error {
            ThreadError::Disconnected => {
                threadwire_log::warn!(thread = %self.uid, "worker disconnected");
            }
            error => threadwire_log::error!(thread = %self.uid, "{error}"),
        }

        // There may be no subscribers.
        self.events.send(error).ok();
    }

    fn take(&self, uid: TaskUid) -> Option<Outstanding> {
        self.state.lock().tasks.remove(&uid)
    }

    fn settle(&self, uid: TaskUid, result: Result<Value, CallError>) {
        let Some(outstanding) = self.take(uid) else {
            return self.emit(ThreadError::UnknownTask(uid));
        };

        match result {
            Ok(value) => outstanding.task.resolve(value),
            Err(error) => outstanding.task.reject(error),
        };
    }

    fn handles(&self) -> Vec<TaskHandle> {
        let state = self.state.lock();
        state.tasks.values().map(|o| o.handle.clone()).collect()
    }

    fn begin_terminate(&self) -> Result<(), TerminateError> {
        let mut state = self.state.lock();
        match state.lifecycle {
            ThreadState::Ready | ThreadState::Disconnected => {
                state.lifecycle = ThreadState::Terminating;
                Ok(())
            }
            ThreadState::Terminating | ThreadState::Terminated => {
                Err(TerminateError::AlreadyTerminated)
            }
        }
    }

    fn finish_terminate(&self) {
        let tasks = {
            let mut state = self.state.lock();
            state.lifecycle = ThreadState::Terminated;
            std::mem::take(&mut state.tasks)
        };

        for outstanding in tasks.into_values() {
            outstanding.task.reject(CallError::Terminated);
        }
    }

    fn disconnect(&self) {
        let tasks = {
            let mut state = self.state.lock();
            match state.lifecycle {
                ThreadState::Ready => state.lifecycle = ThreadState::Disconnected,
                ThreadState::Terminating => (),
                ThreadState::Terminated | ThreadState::Disconnected => return,
            }
            std::mem::take(&mut state.tasks)
        };

        for outstanding in tasks.into_values() {
            outstanding.task.reject(CallError::Disconnected);
        }

        self.emit(ThreadError::Disconnected);
    }
}

/// Routes replies of the worker to their tasks until the channel ends.
async fn dispatch(shared: Arc<Shared>, mut receiver: Receiver<WorkerMessage>) {
    while let Some(message) = receiver.recv().await {
        match message {
            Ok(WorkerMessage::TaskResult { uid, result }) => shared.settle(uid, Ok(result)),
            Ok(WorkerMessage::TaskError { uid, error_message }) => {
                shared.settle(uid, Err(CallError::Failed(error_message)))
            }
            Ok(WorkerMessage::UncaughtError { error_message }) => {
                shared.emit(ThreadError::Uncaught(error_message))
            }
            Ok(WorkerMessage::Init { .. }) => {
                threadwire_log::warn!(thread = %shared.uid, "ignoring repeated init message");
            }
            Err(error) => shared.emit(ThreadError::Malformed(LogError(&error).to_string())),
        }
    }

    shared.disconnect();
}

/// Waits for the init message of a worker.
async fn handshake(receiver: &mut Receiver<WorkerMessage>) -> Result<Vec<String>, SpawnError> {
    match receiver.recv().await {
        Some(Ok(WorkerMessage::Init { method_names })) => Ok(method_names),
        Some(Ok(WorkerMessage::UncaughtError { error_message })) => {
            Err(SpawnError::InitFailed(error_message))
        }
        Some(Ok(message)) => Err(SpawnError::UnexpectedMessage(message.kind())),
        Some(Err(error)) => Err(SpawnError::Malformed(error)),
        None => Err(SpawnError::Disconnected),
    }
}

struct Inner {
    shared: Arc<Shared>,
    sender: Sender<ControllerMessage>,
    method_names: BTreeSet<String>,
    dispatcher: AbortHandle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.sender.close();
    }
}

/// The controller's handle to a single worker.
///
/// A thread is created by [`spawn`](Self::spawn), which completes once the worker has announced
/// its methods. Calls are issued through [`call`](Self::call) or the [`methods`](Self::methods)
/// table and return a [`TaskHandle`] immediately. Replies may arrive in any order, they are
/// matched to their calls by uid.
///
/// Threads are cheap to clone. The worker is shut down by [`terminate`](Self::terminate) or once
/// the last clone is dropped.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<Inner>,
}

impl Thread {
    /// Performs the init handshake with a worker and returns a thread once it is ready.
    ///
    /// Fails if the worker does not send its init message within
    /// [`init_timeout`](ThreadOptions::init_timeout), reports an error, or sends anything else
    /// first. The channel is closed on failure. Must be called from within a Tokio runtime.
    pub async fn spawn(
        channel: ControllerChannel,
        options: ThreadOptions,
    ) -> Result<Self, SpawnError> {
        let Channel {
            sender,
            mut receiver,
        } = channel;

        let handshake = tokio::time::timeout(options.init_timeout, handshake(&mut receiver)).await;
        let method_names = match handshake {
            Ok(Ok(method_names)) => method_names,
            Ok(Err(error)) => {
                sender.close();
                return Err(error);
            }
            Err(_) => {
                sender.close();
                return Err(SpawnError::Timeout(options.init_timeout));
            }
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            uid: ThreadUid::new(),
            state: Mutex::new(State {
                lifecycle: ThreadState::Ready,
                tasks: HashMap::new(),
            }),
            events,
        });

        threadwire_log::debug!(
            thread = %shared.uid,
            methods = method_names.len(),
            "worker is ready"
        );

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), receiver)).abort_handle();

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                sender,
                method_names: method_names.into_iter().collect(),
                dispatcher,
            }),
        })
    }

    /// Returns the identifier of this thread.
    pub fn uid(&self) -> ThreadUid {
        self.inner.shared.uid
    }

    /// Returns the table of methods the worker announced.
    pub fn methods(&self) -> Methods<'_> {
        Methods { thread: self }
    }

    /// Calls a method of the worker.
    ///
    /// Arguments wrapped in a [`TransferDescriptor`](threadwire_protocol::TransferDescriptor) move
    /// their buffers to the worker, all other arguments are copied. The call is queued without
    /// waiting for the worker. Calls to unknown methods, and calls on a thread that is terminating
    /// or whose worker went away, are rejected without being sent.
    pub fn call(&self, method: &str, args: Vec<Payload>) -> TaskHandle {
        let (task, handle) = Task::create();

        if !self.inner.method_names.contains(method) {
            task.reject(CallError::UnknownMethod(method.to_owned()));
            return handle;
        }

        let uid = task.uid();
        let (args, transfer) = split_payloads(args);

        {
            let mut state = self.inner.shared.state.lock();
            match state.lifecycle {
                ThreadState::Ready => (),
                ThreadState::Terminating | ThreadState::Terminated => {
                    task.reject(CallError::Terminated);
                    return handle;
                }
                ThreadState::Disconnected => {
                    task.reject(CallError::Disconnected);
                    return handle;
                }
            }

            let outstanding = Outstanding {
                task,
                handle: handle.clone(),
            };
            state.tasks.insert(uid, outstanding);
        }

        let message = ControllerMessage::Run {
            uid,
            method: method.to_owned(),
            args,
        };

        if let Err(error) = self.inner.sender.send(message, transfer) {
            let error = match error {
                ChannelError::Transfer(error) => CallError::Transfer(error),
                ChannelError::Closed => CallError::Disconnected,
                error => CallError::Send(error.to_string()),
            };

            if let Some(outstanding) = self.inner.shared.take(uid) {
                outstanding.task.reject(error);
            }
        }

        handle
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.inner.shared.state.lock().lifecycle
    }

    /// Returns the number of calls that have been sent but not yet answered.
    pub fn num_queued_tasks(&self) -> usize {
        self.inner.shared.state.lock().tasks.len()
    }

    /// Waits until every call outstanding at the time of calling has been resolved or rejected.
    pub async fn settled(&self) {
        future::join_all(self.inner.shared.handles()).await;
    }

    /// Waits until every call outstanding at the time of calling has been resolved.
    ///
    /// Fails with the first rejection.
    pub async fn resolved(&self) -> Result<(), CallError> {
        future::try_join_all(self.inner.shared.handles()).await?;
        Ok(())
    }

    /// Subscribes to errors of this thread that are not tied to any call.
    pub fn errors(&self) -> broadcast::Receiver<ThreadError> {
        self.inner.shared.events.subscribe()
    }

    /// Shuts the worker down after all outstanding calls have settled.
    ///
    /// New calls are rejected as soon as termination starts. With `force_terminate_shared`, a
    /// shared worker shuts down for all of its clients instead of disconnecting only this one.
    pub async fn terminate(&self, force_terminate_shared: bool) -> Result<(), TerminateError> {
        self.inner.shared.begin_terminate()?;
        self.settled().await;
        self.shutdown(force_terminate_shared);
        Ok(())
    }

    /// Shuts the worker down without waiting.
    ///
    /// All outstanding calls are rejected with [`CallError::Terminated`].
    pub fn terminate_now(&self, force_terminate_shared: bool) -> Result<(), TerminateError> {
        self.inner.shared.begin_terminate()?;
        self.shutdown(force_terminate_shared);
        Ok(())
    }

    fn shutdown(&self, force_terminate_shared: bool) {
        let message = ControllerMessage::Terminate {
            force_terminate_shared,
        };

        if let Err(error) = self.inner.sender.send(message, Vec::new()) {
            threadwire_log::debug!(
                thread = %self.uid(),
                "could not send terminate message: {}",
                LogError(&error)
            );
        }

        self.inner.dispatcher.abort();
        self.inner.sender.close();
        self.inner.shared.finish_terminate();

        threadwire_log::debug!(thread = %self.uid(), "thread terminated");
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("uid", &self.uid())
            .field("state", &self.state())
            .field("methods", &self.inner.method_names)
            .finish()
    }
}

/// The methods a worker announced during its handshake.
#[derive(Clone, Copy, Debug)]
pub struct Methods<'a> {
    thread: &'a Thread,
}

impl<'a> Methods<'a> {
    /// Returns a callable proxy for the method, if the worker exposes it.
    pub fn get(&self, name: &str) -> Option<Proxy<'a>> {
        let name = self.thread.inner.method_names.get(name)?;
        Some(Proxy {
            thread: self.thread,
            name,
        })
    }

    /// Returns `true` if the worker exposes a method with this name.
    pub fn contains(&self, name: &str) -> bool {
        self.thread.inner.method_names.contains(name)
    }

    /// Returns the method names in sorted order.
    pub fn names(self) -> impl Iterator<Item = &'a str> {
        self.thread.inner.method_names.iter().map(String::as_str)
    }

    /// Returns the number of methods.
    pub fn len(&self) -> usize {
        self.thread.inner.method_names.len()
    }

    /// Returns `true` if the worker exposes no methods.
    pub fn is_empty(&self) -> bool {
        self.thread.inner.method_names.is_empty()
    }
}

/// A callable method of a worker.
#[derive(Clone, Copy, Debug)]
pub struct Proxy<'a> {
    thread: &'a Thread,
    name: &'a str,
}

impl Proxy<'_> {
    /// Returns the name of the method.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Calls the method, see [`Thread::call`].
    pub fn call(&self, args: Vec<Payload>) -> TaskHandle {
        self.thread.call(self.name, args)
    }
}

#[cfg(test)]
mod tests {
    use threadwire_channel::{WorkerChannel, local};
    use threadwire_protocol::{Buffer, TransferDescriptor, TransferError};

    use super::*;

    fn init(worker: &WorkerChannel, methods: &[&str]) {
        let method_names = methods.iter().map(|&m| m.to_owned()).collect();
        worker
            .sender
            .send(WorkerMessage::Init { method_names }, Vec::new())
            .unwrap();
    }

    async fn spawn_manual(methods: &[&str]) -> (Thread, WorkerChannel) {
        let (controller, worker) = local::pair();
        init(&worker, methods);
        let thread = Thread::spawn(controller, ThreadOptions::default())
            .await
            .unwrap();
        (thread, worker)
    }

    async fn next_run(worker: &mut WorkerChannel) -> (TaskUid, String, Vec<Value>) {
        match worker.receiver.recv().await {
            Some(Ok(ControllerMessage::Run { uid, method, args })) => (uid, method, args),
            other => panic!("expected run message, got {other:?}"),
        }
    }

    fn reply(worker: &WorkerChannel, message: WorkerMessage) {
        worker.sender.send(message, Vec::new()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout() {
        let (controller, mut worker): (ControllerChannel, WorkerChannel) = local::pair();

        let options = ThreadOptions {
            init_timeout: Duration::from_secs(2),
        };
        let error = Thread::spawn(controller, options).await.unwrap_err();

        insta::assert_snapshot!(error, @"did not receive an init message from worker within 2s");
        assert!(worker.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_init_uncaught_error() {
        let (controller, worker): (ControllerChannel, WorkerChannel) = local::pair();
        reply(
            &worker,
            WorkerMessage::UncaughtError {
                error_message: "missing model".to_owned(),
            },
        );

        let error = Thread::spawn(controller, ThreadOptions::default())
            .await
            .unwrap_err();
        insta::assert_snapshot!(error, @"worker failed to initialize: missing model");
    }

    #[tokio::test]
    async fn test_init_unexpected_message() {
        let (controller, worker): (ControllerChannel, WorkerChannel) = local::pair();
        reply(
            &worker,
            WorkerMessage::TaskResult {
                uid: TaskUid::new(),
                result: Value::Null,
            },
        );

        let error = Thread::spawn(controller, ThreadOptions::default())
            .await
            .unwrap_err();
        insta::assert_snapshot!(error, @"received task_result message from worker before init");
    }

    #[tokio::test]
    async fn test_replies_out_of_order() {
        let (thread, mut worker) = spawn_manual(&["slow", "fast"]).await;

        let slow = thread.methods().get("slow").unwrap().call(Vec::new());
        let fast = thread.call("fast", vec![Payload::from(1)]);
        assert_eq!(thread.num_queued_tasks(), 2);

        let (slow_uid, _, _) = next_run(&mut worker).await;
        let (fast_uid, method, args) = next_run(&mut worker).await;
        assert_eq!(method, "fast");
        assert_eq!(args, vec![Value::Int(1)]);

        reply(
            &worker,
            WorkerMessage::TaskResult {
                uid: fast_uid,
                result: Value::from("fast"),
            },
        );
        assert_eq!(fast.await, Ok(Value::from("fast")));
        assert_eq!(thread.num_queued_tasks(), 1);

        reply(
            &worker,
            WorkerMessage::TaskError {
                uid: slow_uid,
                error_message: "boom".to_owned(),
            },
        );
        assert_eq!(slow.await, Err(CallError::Failed("boom".to_owned())));
        assert_eq!(thread.num_queued_tasks(), 0);
        assert_eq!(thread.state(), ThreadState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_sent() {
        let (thread, _worker) = spawn_manual(&["helloWorld"]).await;

        assert!(thread.methods().get("nope").is_none());
        let error = thread.call("nope", Vec::new()).await.unwrap_err();

        insta::assert_snapshot!(error, @"unknown method `nope`");
        assert_eq!(thread.num_queued_tasks(), 0);
    }

    #[tokio::test]
    async fn test_invalid_transfer_rejects_call() {
        let (thread, _worker) = spawn_manual(&["fill"]).await;

        let buffer = Buffer::from(vec![1]);
        buffer.detach();
        let descriptor = TransferDescriptor::buffer(buffer);

        let result = thread.call("fill", vec![descriptor.into()]).await;
        assert_eq!(result, Err(CallError::Transfer(TransferError::Detached(0))));
        assert_eq!(thread.num_queued_tasks(), 0);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_events() {
        let (thread, worker) = spawn_manual(&["helloWorld"]).await;
        let mut errors = thread.errors();

        let stray = TaskUid::new();
        reply(
            &worker,
            WorkerMessage::TaskResult {
                uid: stray,
                result: Value::Null,
            },
        );
        reply(
            &worker,
            WorkerMessage::UncaughtError {
                error_message: "oops".to_owned(),
            },
        );

        assert_eq!(errors.recv().await.unwrap(), ThreadError::UnknownTask(stray));
        assert_eq!(
            errors.recv().await.unwrap(),
            ThreadError::Uncaught("oops".to_owned())
        );
        assert_eq!(thread.state(), ThreadState::Ready);
    }

    #[tokio::test]
    async fn test_repeated_init_is_ignored() {
        let (thread, mut worker) = spawn_manual(&["a"]).await;
        init(&worker, &["a", "b"]);

        let task = thread.call("a", Vec::new());
        let (uid, _, _) = next_run(&mut worker).await;
        reply(
            &worker,
            WorkerMessage::TaskResult {
                uid,
                result: Value::Null,
            },
        );

        assert_eq!(task.await, Ok(Value::Null));
        assert!(!thread.methods().contains("b"));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_outstanding() {
        let (thread, mut worker) = spawn_manual(&["helloWorld"]).await;
        let mut errors = thread.errors();

        let task = thread.call("helloWorld", Vec::new());
        next_run(&mut worker).await;
        drop(worker);

        assert_eq!(task.await, Err(CallError::Disconnected));
        assert_eq!(errors.recv().await.unwrap(), ThreadError::Disconnected);
        assert_eq!(thread.state(), ThreadState::Disconnected);

        let late = thread.call("helloWorld", Vec::new()).await;
        assert_eq!(late, Err(CallError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_waits_for_pending_task() {
        let (thread, mut worker) = spawn_manual(&["slow"]).await;

        let task = thread.call("slow", Vec::new());
        let (uid, _, _) = next_run(&mut worker).await;

        let terminating = tokio::spawn({
            let thread = thread.clone();
            async move { thread.terminate(false).await }
        });

        // Nothing is sent while the call is outstanding.
        let early = tokio::time::timeout(Duration::from_secs(1), worker.receiver.recv()).await;
        assert!(early.is_err());
        assert_eq!(thread.state(), ThreadState::Terminating);
        assert_eq!(
            thread.call("slow", Vec::new()).await,
            Err(CallError::Terminated)
        );

        reply(
            &worker,
            WorkerMessage::TaskResult {
                uid,
                result: Value::Int(1),
            },
        );
        assert_eq!(task.await, Ok(Value::Int(1)));

        assert!(matches!(
            worker.receiver.recv().await,
            Some(Ok(ControllerMessage::Terminate {
                force_terminate_shared: false
            }))
        ));
        terminating.await.unwrap().unwrap();

        assert!(worker.receiver.recv().await.is_none());
        assert_eq!(thread.num_queued_tasks(), 0);
        assert_eq!(thread.state(), ThreadState::Terminated);
        assert_eq!(
            thread.terminate(false).await,
            Err(TerminateError::AlreadyTerminated)
        );
    }

    #[tokio::test]
    async fn test_terminate_now_rejects_outstanding() {
        let (thread, mut worker) = spawn_manual(&["slow"]).await;

        let task = thread.call("slow", Vec::new());
        next_run(&mut worker).await;

        thread.terminate_now(true).unwrap();

        assert_eq!(task.await, Err(CallError::Terminated));
        assert!(matches!(
            worker.receiver.recv().await,
            Some(Ok(ControllerMessage::Terminate {
                force_terminate_shared: true
            }))
        ));
        assert_eq!(thread.num_queued_tasks(), 0);
    }
}
