//! # Threadwire Threading
//!
//! The controller side of threadwire: calling methods of workers that run in their own threads or
//! processes, and managing pools of them.
//!
//! - **[`Thread`]**: owns the channel to one worker. Spawning a thread performs the init handshake,
//!   in which the worker announces its methods. Afterwards every call returns a [`TaskHandle`]
//!   right away, which completes with the worker's reply.
//! - **[`Task`]**: the settling half of a call. It is settled at most once, replies are matched to
//!   tasks by their uid.
//! - **[`ThreadPool`]**: a fixed set of threads spawned all or nothing. Work goes to the thread with
//!   the fewest outstanding calls.
//!
//! ## Errors
//!
//! A call that fails on the worker rejects only its own task with [`CallError::Failed`]. Errors
//! that are not tied to a call, such as uncaught worker errors or replies for unknown tasks, are
//! published as [`ThreadError`] events through [`Thread::errors`], and for pools as
//! [`PoolEvent`]s through [`ThreadPool::errors`]. If the worker goes away, all outstanding calls
//! are rejected with [`CallError::Disconnected`].
//!
//! ## Termination
//!
//! [`Thread::terminate`] rejects new calls, waits until all outstanding calls have settled and
//! only then shuts the worker down. [`Thread::terminate_now`] skips the wait.

#![warn(missing_docs)]

mod builder;
mod pool;
mod task;
mod thread;

pub use self::builder::*;
pub use self::pool::*;
pub use self::task::*;
pub use self::thread::*;
