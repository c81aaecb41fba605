use std::fmt::{self, Write};
use std::future::Future;

use futures::future;
use threadwire_log::LogError;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;

use crate::builder::{SpawnThread, ThreadHook, ThreadPoolBuilder};
use crate::task::CallError;
use crate::thread::{SpawnError, Thread, ThreadError};

/// Capacity of the error event stream of a pool.
const EVENT_CAPACITY: usize = 256;

/// Options for spawning a [`ThreadPool`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolOptions {
    /// Number of threads, defaults to the number of CPUs.
    pub size: usize,
    /// Name of the pool used in errors and logs.
    pub name: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: num_cpus::get(),
            name: "ThreadPool".to_owned(),
        }
    }
}

/// A failure of a single thread during a pool-wide operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadFailure {
    /// Index of the thread in the pool.
    pub index: usize,
    /// What went wrong.
    pub reason: String,
}

impl fmt::Display for ThreadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread #{}: {}", self.index, self.reason)
    }
}

fn list_failures(failures: &[ThreadFailure]) -> String {
    let mut message = String::new();
    for (i, failure) in failures.iter().enumerate() {
        if i > 0 {
            message.push_str("; ");
        }
        write!(message, "{failure}").ok();
    }
    message
}

/// Errors raised by pool-wide operations.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// The pool was configured without threads.
    #[error("pool size must be at least 1")]
    InvalidSize,
    /// One or more threads failed to spawn or initialise. No thread of the pool is left running.
    #[error("failed to spawn {name}: {}", list_failures(.failures))]
    Spawn {
        /// Name of the pool.
        name: String,
        /// Every failed thread, by index.
        failures: Vec<ThreadFailure>,
    },
    /// One or more threads failed to terminate cleanly.
    #[error("failed to terminate {name}: {}", list_failures(.failures))]
    Terminate {
        /// Name of the pool.
        name: String,
        /// Every failed thread, by index.
        failures: Vec<ThreadFailure>,
    },
}

/// An error of one of the pool's threads that is not tied to any call.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolEvent {
    /// Index of the thread in the pool.
    pub index: usize,
    /// The thread's error.
    pub error: ThreadError,
}

/// Returns the index of the smallest load, preferring the lowest index on ties.
///
/// Returns `None` if there are no loads.
pub fn select_least_loaded(loads: &[usize]) -> Option<usize> {
    loads
        .iter()
        .enumerate()
        .min_by_key(|&(_, load)| load)
        .map(|(index, _)| index)
}

/// A spawned thread along with its error events since the spawn.
type Spawned = (Thread, broadcast::Receiver<ThreadError>);

async fn spawn_one(
    index: usize,
    spawn_thread: &SpawnThread,
    initialise: Option<&ThreadHook>,
) -> Result<Spawned, String> {
    let thread = spawn_thread(index)
        .await
        .map_err(|error: SpawnError| format!("{:#}", LogError(&error)))?;

    // Subscribe before initialising, so errors raised by the hook reach the pool's events.
    let errors = thread.errors();

    if let Some(initialise) = initialise {
        if let Err(reason) = initialise(index, thread.clone()).await {
            // The thread has not been handed out yet, so it cannot be terminated already.
            thread.terminate_now(false).ok();
            return Err(reason);
        }
    }

    Ok((thread, errors))
}

async fn roll_back(index: usize, thread: Thread, on_terminate: Option<&ThreadHook>) {
    if let Some(on_terminate) = on_terminate {
        if let Err(reason) = on_terminate(index, thread.clone()).await {
            threadwire_log::warn!(index, "terminate hook failed during rollback: {reason}");
        }
    }

    thread.terminate_now(false).ok();
}

async fn forward_errors(
    index: usize,
    mut errors: broadcast::Receiver<ThreadError>,
    events: broadcast::Sender<PoolEvent>,
) {
    loop {
        match errors.recv().await {
            Ok(error) => {
                events.send(PoolEvent { index, error }).ok();
            }
            Err(RecvError::Lagged(skipped)) => {
                threadwire_log::warn!(index, skipped, "pool missed thread errors");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// A fixed set of [`Thread`]s with least-loaded dispatch.
///
/// Pools are spawned through [`ThreadPool::builder`]. Work is handed to the thread with the fewest
/// outstanding calls by [`queue`](Self::queue). Errors of all threads that are not tied to any call
/// are re-emitted through [`errors`](Self::errors), tagged with the thread's index.
///
/// # Example
///
/// ```
/// use threadwire_threading::{Thread, ThreadOptions, ThreadPool};
/// use threadwire_worker::{Api, ThreadWorker};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let pool = ThreadPool::builder(|index| async move {
///     let api = Api::new().function("helloWorld", |_| Ok::<_, String>("Hello World!"));
///     let channel = ThreadWorker::expose(format!("hello-{index}"), api)?;
///     Thread::spawn(channel, ThreadOptions::default()).await
/// })
/// .size(2)
/// .spawn()
/// .await
/// .unwrap();
///
/// let greeting = pool.queue(|thread| thread.call("helloWorld", Vec::new())).await;
/// assert_eq!(greeting.unwrap().as_str(), Some("Hello World!"));
///
/// pool.terminate(false).await.unwrap();
/// # });
/// ```
pub struct ThreadPool {
    name: String,
    threads: Vec<Thread>,
    on_terminate: Option<Box<ThreadHook>>,
    events: broadcast::Sender<PoolEvent>,
    forwarders: Vec<AbortHandle>,
}

impl ThreadPool {
    /// Returns a builder for a pool whose threads are created by `spawn_thread`.
    ///
    /// The function receives the index of the thread to spawn.
    pub fn builder<F, Fut>(spawn_thread: F) -> ThreadPoolBuilder
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Thread, SpawnError>> + Send + 'static,
    {
        ThreadPoolBuilder::new(spawn_thread)
    }

    pub(crate) async fn new(builder: ThreadPoolBuilder) -> Result<Self, PoolError> {
        let ThreadPoolBuilder {
            spawn_thread,
            options,
            initialise,
            on_terminate,
        } = builder;
        let PoolOptions { size, name } = options;

        if size == 0 {
            return Err(PoolError::InvalidSize);
        }

        threadwire_log::debug!(pool = %name, size, "spawning thread pool");

        let attempts =
            (0..size).map(|index| spawn_one(index, &*spawn_thread, initialise.as_deref()));
        let results = future::join_all(attempts).await;

        let mut threads = Vec::with_capacity(size);
        let mut failures = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(spawned) => threads.push((index, spawned)),
                Err(reason) => failures.push(ThreadFailure { index, reason }),
            }
        }

        if !failures.is_empty() {
            threadwire_log::warn!(
                pool = %name,
                failed = failures.len(),
                "failed to spawn thread pool, terminating spawned threads"
            );

            let rollbacks = threads
                .into_iter()
                .map(|(index, (thread, _))| roll_back(index, thread, on_terminate.as_deref()));
            future::join_all(rollbacks).await;

            return Err(PoolError::Spawn { name, failures });
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut forwarders = Vec::with_capacity(size);
        let threads = threads
            .into_iter()
            .map(|(index, (thread, errors))| {
                let forwarder = tokio::spawn(forward_errors(index, errors, events.clone()));
                forwarders.push(forwarder.abort_handle());
                thread
            })
            .collect();

        Ok(Self {
            name,
            threads,
            on_terminate,
            events,
            forwarders,
        })
    }

    /// Returns the name of the pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Returns `true` if the pool has no threads, which never happens for a spawned pool.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Returns all threads in index order.
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    /// Returns the number of outstanding calls across all threads.
    pub fn num_queued_tasks(&self) -> usize {
        self.threads.iter().map(Thread::num_queued_tasks).sum()
    }

    /// Runs `f` with the thread that has the fewest outstanding calls.
    ///
    /// Ties go to the thread with the lowest index. `f` usually issues a call and returns its
    /// [`TaskHandle`](crate::TaskHandle).
    pub fn queue<'a, F, R>(&'a self, f: F) -> R
    where
        F: FnOnce(&'a Thread) -> R,
    {
        let loads: Vec<usize> = self.threads.iter().map(Thread::num_queued_tasks).collect();
        let index = select_least_loaded(&loads).unwrap_or_default();
        f(&self.threads[index])
    }

    /// Waits until every outstanding call on every thread has settled.
    pub async fn settled(&self) {
        future::join_all(self.threads.iter().map(Thread::settled)).await;
    }

    /// Waits until every outstanding call on every thread has resolved.
    ///
    /// Fails with the first rejection.
    pub async fn resolved(&self) -> Result<(), CallError> {
        future::try_join_all(self.threads.iter().map(Thread::resolved)).await?;
        Ok(())
    }

    /// Subscribes to errors of all threads that are not tied to any call.
    pub fn errors(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Terminates all threads concurrently.
    ///
    /// Runs the pool's terminate hook before terminating each thread, then waits for its
    /// outstanding calls to settle. Returns once every thread is done, with all failures collected.
    pub async fn terminate(&self, force_terminate_shared: bool) -> Result<(), PoolError> {
        let on_terminate = self.on_terminate.as_deref();

        let shutdowns = self.threads.iter().enumerate().map(|(index, thread)| async move {
            let mut failures = Vec::new();

            if let Some(on_terminate) = on_terminate {
                if let Err(reason) = on_terminate(index, thread.clone()).await {
                    failures.push(ThreadFailure { index, reason });
                }
            }

            if let Err(error) = thread.terminate(force_terminate_shared).await {
                let reason = error.to_string();
                failures.push(ThreadFailure { index, reason });
            }

            failures
        });

        let failures: Vec<_> = future::join_all(shutdowns)
            .await
            .into_iter()
            .flatten()
            .collect();

        if failures.is_empty() {
            threadwire_log::debug!(pool = %self.name, "thread pool terminated");
            return Ok(());
        }

        Err(PoolError::Terminate {
            name: self.name.clone(),
            failures,
        })
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}
