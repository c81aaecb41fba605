//! Logging facade for threadwire.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be obtained from configuration files. This requires the
//! `init` feature.
//!
//! ```
//! # #[cfg(feature = "init")] {
//! use threadwire_log::LogConfig;
//!
//! let log_config = LogConfig {
//!     enable_backtraces: true,
//!     ..LogConfig::default()
//! };
//!
//! threadwire_log::init(&log_config);
//! # }
//! ```
//!
//! Log output always goes to `stderr`. Process-backed workers use their `stdout` as the message
//! channel to the controller, so nothing else may ever be written there.
//!
//! # Logging
//!
//! The basic use of the log crate is through the five logging macros: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`] where `error!` represents the highest-priority log messages
//! and `trace!` the lowest. The log messages are filtered by configuring the log level to exclude
//! messages with a lower priority. Each of these macros accept format strings similarly to
//! [`println!`].
//!
//! ## Conventions
//!
//! Log messages should start lowercase and end without punctuation. Prefer short and precise log
//! messages over verbose text. Choose the log level according to these rules:
//!
//! - [`error!`] for bugs and protocol violations.
//! - [`warn!`] for undesirable behavior, such as a worker that disconnected unexpectedly.
//! - [`info!`] for messages relevant to the average user.
//! - [`debug!`] for lifecycle details of threads and pools.
//! - [`trace!`] for individual calls and messages.
//!
//! ## Logging Error Types
//!
//! To log errors with all their causes, use the [`LogError`] wrapper.
//!
//! ```
//! use std::io::{Error, ErrorKind};
//! use threadwire_log::LogError;
//!
//! let custom_error = Error::new(ErrorKind::Other, "oh no!");
//! threadwire_log::error!("operation failed: {}", LogError(&custom_error));
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be called
//! at the beginning of test method. It enables test mode of the logger and customizes log levels
//! for the current crate. This requires the `test` feature.
//!
//! ```
//! # #[cfg(feature = "test")]
//! #[test]
//! fn test_something() {
//!     threadwire_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, error, info, trace, warn};
