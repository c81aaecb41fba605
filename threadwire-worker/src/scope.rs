use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use threadwire_channel::{Channel, ChannelError, Receiver, Sender, WorkerChannel};
use threadwire_log::LogError;
use threadwire_protocol::{ControllerMessage, Payload, TaskUid, Value, WorkerMessage};

use crate::api::{Api, Args, Handler};

/// Errors returned by [`WorkerScope::expose`].
#[derive(Debug, thiserror::Error)]
pub enum ExposeError {
    /// An API was already exposed through this scope.
    #[error("expose() should only be called once")]
    AlreadyExposed,
    /// The init message could not be sent to the controller.
    #[error("failed to announce methods to the controller")]
    Init(#[source] ChannelError),
}

/// How serving a controller connection ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Served {
    /// The controller closed the channel.
    Disconnected,
    /// The controller sent a terminate message.
    Terminated { force_terminate_shared: bool },
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_owned()
    }
}

/// Runs one call to completion and posts its reply.
fn run(
    sender: Sender<WorkerMessage>,
    handler: Option<Handler>,
    uid: TaskUid,
    method: String,
    args: Vec<Value>,
) -> BoxFuture<'static, ()> {
    async move {
        let outcome = match handler {
            Some(handler) => AssertUnwindSafe(async move { handler(Args::new(args)).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(&*panic);
                    threadwire_log::error!(%method, "method panicked: {message}");
                    Err(message)
                }),
            None => Err(format!("unknown method `{method}`")),
        };

        reply(&sender, uid, outcome);
    }
    .boxed()
}

fn reply(sender: &Sender<WorkerMessage>, uid: TaskUid, outcome: Result<Payload, String>) {
    let error_message = match outcome {
        Ok(payload) => {
            let (result, transfer) = payload.into_parts();
            match sender.send(WorkerMessage::TaskResult { uid, result }, transfer) {
                Ok(()) => return,
                Err(ChannelError::Closed) => {
                    threadwire_log::debug!(%uid, "dropping result, controller is gone");
                    return;
                }
                // The result could not be sent, report that to the caller instead.
                Err(error) => LogError(&error).to_string(),
            }
        }
        Err(error_message) => error_message,
    };

    if let Err(error) = sender.send(WorkerMessage::TaskError { uid, error_message }, Vec::new()) {
        threadwire_log::debug!(%uid, "dropping error: {}", LogError(&error));
    }
}

/// Serves calls from one controller until it terminates or disconnects.
pub(crate) async fn serve(
    channel: WorkerChannel,
    api: Arc<Api>,
) -> Result<Served, ChannelError> {
    let Channel {
        sender,
        mut receiver,
    } = channel;

    let method_names = api.method_names();
    sender.send(WorkerMessage::Init { method_names }, Vec::new())?;

    let served = dispatch(&sender, &mut receiver, &api).await;
    threadwire_log::debug!("stopped serving: {served:?}");

    // Tasks that are still running have been dropped along with the dispatch loop.
    sender.close();
    Ok(served)
}

async fn dispatch(
    sender: &Sender<WorkerMessage>,
    receiver: &mut Receiver<ControllerMessage>,
    api: &Api,
) -> Served {
    let mut running = FuturesUnordered::new();

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(Ok(ControllerMessage::Run { uid, method, args })) => {
                    threadwire_log::trace!(%uid, %method, "running method");
                    let handler = api.handler(&method).cloned();
                    running.push(run(sender.clone(), handler, uid, method, args));
                }
                Some(Ok(ControllerMessage::Terminate { force_terminate_shared })) => {
                    return Served::Terminated { force_terminate_shared };
                }
                Some(Err(error)) => {
                    threadwire_log::error!("received malformed message: {}", LogError(&error));
                    let error_message = format!("received malformed message: {error}");
                    let uncaught = WorkerMessage::UncaughtError { error_message };
                    if sender.send(uncaught, Vec::new()).is_err() {
                        return Served::Disconnected;
                    }
                }
                None => return Served::Disconnected,
            },
            Some(()) = running.next(), if !running.is_empty() => (),
        }
    }
}

/// The worker side of a single controller connection.
///
/// A scope announces an [`Api`] to the controller with [`expose`](Self::expose) and then serves
/// calls until the controller terminates it. Errors that are not tied to any call can be reported
/// with [`report_error`](Self::report_error).
pub struct WorkerScope {
    sender: Sender<WorkerMessage>,
    receiver: Mutex<Option<Receiver<ControllerMessage>>>,
    exposed: AtomicBool,
}

impl WorkerScope {
    /// Creates a scope for the given channel to the controller.
    pub fn new(channel: WorkerChannel) -> Self {
        Self {
            sender: channel.sender,
            receiver: Mutex::new(Some(channel.receiver)),
            exposed: AtomicBool::new(false),
        }
    }

    /// Announces the API to the controller and serves calls.
    ///
    /// Every call runs concurrently with all others. Completes once the controller sends a
    /// terminate message or closes the channel. An API can only be exposed once per scope.
    pub async fn expose(&self, api: Api) -> Result<(), ExposeError> {
        if self.exposed.swap(true, Ordering::SeqCst) {
            return Err(ExposeError::AlreadyExposed);
        }

        let receiver = self.receiver.lock().take().ok_or(ExposeError::AlreadyExposed)?;
        let channel = Channel::new(self.sender.clone(), receiver);

        serve(channel, Arc::new(api)).await.map_err(ExposeError::Init)?;
        Ok(())
    }

    /// Reports an error that is not attributable to any call.
    pub fn report_error(&self, message: impl fmt::Display) {
        let error_message = message.to_string();
        if let Err(error) = self.sender.send(WorkerMessage::UncaughtError { error_message }, Vec::new()) {
            threadwire_log::debug!("failed to report error: {}", LogError(&error));
        }
    }
}

impl fmt::Debug for WorkerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerScope")
            .field("exposed", &self.exposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
