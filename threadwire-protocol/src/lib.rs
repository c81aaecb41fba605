//! Wire protocol for threadwire.
//!
//! This crate defines everything that crosses the boundary between a controller and one of its
//! workers:
//!
//!  - [`ControllerMessage`] and [`WorkerMessage`], the closed set of messages in both directions.
//!  - [`Value`], the structured value model carried by calls and their results.
//!  - [`Buffer`] and [`TransferDescriptor`], which mark bytes for ownership transfer instead of
//!    copying.
//!  - [`codec`], the binary encoding used by transports that cross a process boundary.
//!
//! # Transfer Semantics
//!
//! Values are never shared across the boundary. A [`Buffer`] that is listed as a transferable
//! moves to the receiver and every handle on the sending side becomes detached. All other buffers
//! in a message are copied.
//!
//! ```
//! use threadwire_protocol::{Buffer, TransferDescriptor, Value};
//!
//! let buffer = Buffer::from(vec![1, 2, 3]);
//! let descriptor = TransferDescriptor::buffer(buffer.clone());
//!
//! let (payload, transferables) = descriptor.into_parts();
//! assert!(matches!(payload, Value::Buffer(_)));
//! assert_eq!(transferables.len(), 1);
//! ```

#![warn(missing_docs)]

mod buffer;
pub mod codec;
mod message;
mod transfer;
mod uid;
mod value;

pub use self::buffer::*;
pub use self::message::*;
pub use self::transfer::*;
pub use self::uid::*;
pub use self::value::*;
