use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use threadwire_channel::{ChannelError, ControllerChannel, Sender, WorkerChannel, local, process};
use threadwire_log::LogError;
use threadwire_protocol::WorkerMessage;
use tokio::runtime::Runtime;

use crate::api::Api;
use crate::scope::{ExposeError, Served, WorkerScope, panic_message, serve};

fn runtime() -> io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

fn report(sender: &Sender<WorkerMessage>, error_message: String) {
    threadwire_log::debug!("worker failed: {error_message}");
    if let Err(error) = sender.send(WorkerMessage::UncaughtError { error_message }, Vec::new()) {
        threadwire_log::debug!("failed to report worker failure: {}", LogError(&error));
    }
}

/// A worker running on a dedicated OS thread.
///
/// The thread runs its own single-threaded Tokio runtime, so handlers never compete with the
/// controller's executor.
#[derive(Debug)]
pub struct ThreadWorker;

impl ThreadWorker {
    /// Starts a worker thread and returns the controller's end of its channel.
    ///
    /// `entry` receives the worker's [`WorkerScope`] and usually calls
    /// [`expose`](WorkerScope::expose) on it. If `entry` returns an error or panics, the failure
    /// is reported to the controller as an uncaught error.
    pub fn spawn<F, Fut, E>(name: impl Into<String>, entry: F) -> io::Result<ControllerChannel>
    where
        F: FnOnce(WorkerScope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let (controller, worker) = local::pair();

        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let reporter = worker.sender.clone();

                let runtime = match runtime() {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        return report(&reporter, format!("failed to start worker runtime: {error}"));
                    }
                };

                let scope = WorkerScope::new(worker);
                let outcome =
                    runtime.block_on(AssertUnwindSafe(async move { entry(scope).await }).catch_unwind());

                match outcome {
                    Ok(Ok(())) => (),
                    Ok(Err(error)) => report(&reporter, error.to_string()),
                    Err(panic) => report(&reporter, panic_message(&*panic)),
                }
            })?;

        Ok(controller)
    }

    /// Starts a worker thread that exposes `api`.
    pub fn expose(name: impl Into<String>, api: Api) -> io::Result<ControllerChannel> {
        Self::spawn(name, move |scope| async move { scope.expose(api).await })
    }
}

/// Serves every connected client until the worker is shut down.
async fn serve_shared(connections: flume::Receiver<WorkerChannel>, api: Arc<Api>) {
    let mut clients = FuturesUnordered::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            channel = connections.recv_async(), if accepting => match channel {
                Ok(channel) => {
                    threadwire_log::debug!("client connected to shared worker");
                    clients.push(serve(channel, Arc::clone(&api)));
                }
                // All handles are gone, finish serving the connected clients.
                Err(_) => accepting = false,
            },
            Some(served) = clients.next(), if !clients.is_empty() => match served {
                Ok(Served::Terminated { force_terminate_shared: true }) => {
                    threadwire_log::debug!("shared worker terminated by client");
                    break;
                }
                Ok(served) => threadwire_log::debug!("client left shared worker: {served:?}"),
                Err(error) => {
                    threadwire_log::debug!("failed to serve client: {}", LogError(&error));
                }
            },
            else => break,
        }
    }

    // Refuse new clients before disconnecting the remaining ones.
    drop(connections);
}

/// A worker on a single OS thread that serves many controllers.
///
/// Every [`connect`](Self::connect) opens a new channel to the same worker, and all clients share
/// its state. A client that terminates with `force_terminate_shared` shuts the worker down for all
/// clients, otherwise only that client is disconnected.
#[derive(Clone, Debug)]
pub struct SharedWorker {
    connect_tx: flume::Sender<WorkerChannel>,
}

impl SharedWorker {
    /// Starts the shared worker thread.
    pub fn spawn(name: impl Into<String>, api: Api) -> io::Result<Self> {
        let runtime = runtime()?;
        let (connect_tx, connect_rx) = flume::unbounded();

        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || runtime.block_on(serve_shared(connect_rx, Arc::new(api))))?;

        Ok(Self { connect_tx })
    }

    /// Opens a new channel to the worker.
    pub fn connect(&self) -> Result<ControllerChannel, ChannelError> {
        let (controller, worker) = local::pair();
        self.connect_tx
            .send(worker)
            .map_err(|_| ChannelError::Closed)?;
        Ok(controller)
    }

    /// Returns `true` until the worker has been shut down.
    pub fn is_running(&self) -> bool {
        !self.connect_tx.is_disconnected()
    }
}

/// Exposes `api` to the controller of this process over stdin and stdout.
///
/// This is the entry point of process-backed workers. Must be called from within a Tokio runtime.
pub async fn expose_stdio(api: Api) -> Result<(), ExposeError> {
    WorkerScope::new(process::stdio()).expose(api).await
}
