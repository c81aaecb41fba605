use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use threadwire_protocol::{Payload, Value, ValueError};

/// Type-erased method handler.
pub(crate) type Handler =
    Arc<dyn Fn(Args) -> BoxFuture<'static, Result<Payload, String>> + Send + Sync>;

/// Error returned by [`Args::arg`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ArgsError {
    /// The call passed fewer arguments than required.
    #[error("missing argument #{0}")]
    Missing(usize),
    /// The argument has an unexpected kind.
    #[error("invalid argument #{index}: {source}")]
    Invalid {
        /// Position of the argument.
        index: usize,
        /// The conversion error.
        source: ValueError,
    },
}

/// Positional arguments of a call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    /// Wraps a list of argument values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Returns the number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the call passed no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw argument at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Converts the argument at `index`.
    ///
    /// Buffers are not copied, the returned buffer shares its contents with the argument.
    pub fn arg<T>(&self, index: usize) -> Result<T, ArgsError>
    where
        T: TryFrom<Value, Error = ValueError>,
    {
        let value = self.get(index).ok_or(ArgsError::Missing(index))?;
        T::try_from(value.clone()).map_err(|source| ArgsError::Invalid { index, source })
    }

    /// Returns all arguments.
    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl IntoIterator for Args {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// The callable surface a worker exposes to its controller.
///
/// Handlers receive the call's [`Args`] and return either a value or an error. Any type that
/// converts into a [`Payload`] can be returned, including a
/// [`TransferDescriptor`](threadwire_protocol::TransferDescriptor) to move buffers back to the
/// controller. The error's `Display` text becomes the message of the call's rejection.
///
/// # Example
///
/// ```
/// use threadwire_worker::{Api, Args};
///
/// let api = Api::new()
///     .function("helloWorld", |_| Ok::<_, String>("Hello World!"))
///     .method("add", |args: Args| async move {
///         let a: i64 = args.arg(0).map_err(|e| e.to_string())?;
///         let b: i64 = args.arg(1).map_err(|e| e.to_string())?;
///         Ok::<_, String>(a + b)
///     });
///
/// assert_eq!(api.method_names(), ["add", "helloWorld"]);
/// ```
#[derive(Clone, Default)]
pub struct Api {
    handlers: BTreeMap<String, Handler>,
}

impl Api {
    /// Creates an API without any methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an asynchronous method.
    ///
    /// Registering a name twice replaces the earlier handler.
    pub fn method<F, Fut, T, E>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Into<Payload> + 'static,
        E: fmt::Display + 'static,
    {
        let handler: Handler = Arc::new(move |args| {
            handler(args)
                .map(|result| result.map(Into::into).map_err(|error| error.to_string()))
                .boxed()
        });

        self.handlers.insert(name.into(), handler);
        self
    }

    /// Registers a synchronous method.
    ///
    /// The function runs on the worker's executor, so it should not block for long.
    pub fn function<F, T, E>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Args) -> Result<T, E> + Send + Sync + 'static,
        T: Into<Payload> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.method(name, move |args| futures::future::ready(handler(args)))
    }

    /// Returns the names of all methods in sorted order.
    pub fn method_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub(crate) fn handler(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
