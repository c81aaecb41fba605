//! Message channels between threadwire controllers and workers.
//!
//! A [`Channel`] is the only way a controller and a worker reach each other. It consists of a
//! [`Sender`], which queues messages without blocking, and a [`Receiver`], which yields incoming
//! messages in the order they were sent.
//!
//! Three transports are provided:
//!
//!  - [`local::pair`] connects two tasks or threads within the same process.
//!  - [`io::framed`] exchanges length-delimited MessagePack frames over any async byte stream.
//!  - [`process::spawn`] and [`process::stdio`] connect a controller to a worker process.
//!
//! Custom transports implement [`Port`] for the sending half and feed a stream into
//! [`Receiver::from_stream`].
//!
//! ```
//! use threadwire_channel::{ControllerChannel, WorkerChannel, local};
//! use threadwire_protocol::WorkerMessage;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let (mut controller, worker): (ControllerChannel, WorkerChannel) = local::pair();
//!
//! let init = WorkerMessage::Init { method_names: vec!["helloWorld".to_owned()] };
//! worker.sender.send(init, Vec::new()).unwrap();
//!
//! let message = controller.receiver.recv().await;
//! assert!(matches!(message, Some(Ok(WorkerMessage::Init { .. }))));
//! # });
//! ```

#![warn(missing_docs)]

mod channel;
pub mod io;
pub mod local;
pub mod process;

pub use self::channel::*;
