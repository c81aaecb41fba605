//! The worker side of threadwire.
//!
//! A worker announces a set of named methods to its controller and then answers calls to them.
//! Methods are collected in an [`Api`] and served through a [`WorkerScope`], which owns the
//! worker's end of a [`Channel`](threadwire_channel::Channel).
//!
//! The crate provides three execution contexts:
//!
//!  - [`ThreadWorker`] runs a worker on a dedicated OS thread within the controller's process.
//!  - [`SharedWorker`] runs one worker thread that any number of controllers can connect to.
//!  - [`expose_stdio`] serves a worker process over its standard input and output.
//!
//! # Example
//!
//! ```
//! use threadwire_protocol::{Value, WorkerMessage};
//! use threadwire_worker::{Api, ThreadWorker};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let api = Api::new().function("helloWorld", |_| Ok::<_, String>("Hello World!"));
//! let mut channel = ThreadWorker::expose("hello", api).unwrap();
//!
//! let init = channel.receiver.recv().await.unwrap().unwrap();
//! assert_eq!(init, WorkerMessage::Init { method_names: vec!["helloWorld".to_owned()] });
//! # channel.sender.close();
//! # });
//! ```

#![warn(missing_docs)]

mod api;
mod context;
mod scope;

pub use self::api::*;
pub use self::context::*;
pub use self::scope::{ExposeError, WorkerScope};
