use std::fmt;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::pool::{PoolError, PoolOptions, ThreadPool};
use crate::thread::{SpawnError, Thread};

/// Type alias for a thread safe closure that spawns the thread with the given index.
pub(crate) type SpawnThread =
    dyn Fn(usize) -> BoxFuture<'static, Result<Thread, SpawnError>> + Send + Sync;

/// Type alias for a thread safe closure that runs a lifecycle step on the thread with the given
/// index.
pub(crate) type ThreadHook =
    dyn Fn(usize, Thread) -> BoxFuture<'static, Result<(), String>> + Send + Sync;

fn boxed_hook<F, Fut, E>(hook: F) -> Box<ThreadHook>
where
    F: Fn(usize, Thread) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display,
{
    Box::new(move |index, thread| {
        hook(index, thread)
            .map(|result| result.map_err(|error| error.to_string()))
            .boxed()
    })
}

/// [`ThreadPoolBuilder`] configures and spawns a [`ThreadPool`].
///
/// Created by [`ThreadPool::builder`] from a function that spawns the thread for a given index.
pub struct ThreadPoolBuilder {
    pub(crate) spawn_thread: Box<SpawnThread>,
    pub(crate) options: PoolOptions,
    pub(crate) initialise: Option<Box<ThreadHook>>,
    pub(crate) on_terminate: Option<Box<ThreadHook>>,
}

impl ThreadPoolBuilder {
    pub(crate) fn new<F, Fut>(spawn_thread: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Thread, SpawnError>> + Send + 'static,
    {
        Self {
            spawn_thread: Box::new(move |index| spawn_thread(index).boxed()),
            options: PoolOptions::default(),
            initialise: None,
            on_terminate: None,
        }
    }

    /// Replaces all options at once.
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the number of threads in the pool.
    ///
    /// Defaults to the number of CPUs.
    pub fn size(mut self, size: usize) -> Self {
        self.options.size = size;
        self
    }

    /// Sets the name of the pool, which is used in errors and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    /// Sets a step that runs on every thread after it has been spawned.
    ///
    /// If the step fails for any thread, that thread is terminated and spawning the pool fails.
    pub fn initialise<F, Fut, E>(mut self, hook: F) -> Self
    where
        F: Fn(usize, Thread) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        self.initialise = Some(boxed_hook(hook));
        self
    }

    /// Sets a step that runs on every thread before it is terminated.
    ///
    /// The step also runs on threads that are torn down because spawning the pool failed.
    pub fn on_terminate<F, Fut, E>(mut self, hook: F) -> Self
    where
        F: Fn(usize, Thread) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        self.on_terminate = Some(boxed_hook(hook));
        self
    }

    /// Spawns all threads concurrently and returns the pool once every one of them is ready.
    ///
    /// Spawning is all or nothing: if any thread fails to spawn or initialise, every thread that
    /// did spawn is terminated again and the failures are returned together.
    pub async fn spawn(self) -> Result<ThreadPool, PoolError> {
        ThreadPool::new(self).await
    }
}

impl fmt::Debug for ThreadPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolBuilder")
            .field("options", &self.options)
            .field("initialise", &self.initialise.is_some())
            .field("on_terminate", &self.on_terminate.is_some())
            .finish_non_exhaustive()
    }
}
