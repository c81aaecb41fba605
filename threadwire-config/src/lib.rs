//! Configuration for the threadwire CLI.
//!
//! The configuration is loaded from a `config.yml` file in a configuration folder. Every key is
//! optional, a missing file yields the default configuration:
//!
//! ```yaml
//! logging:
//!   level: info
//!   format: auto
//! threads:
//!   init_timeout: 10
//! pool:
//!   size: 4
//!   name: ThreadPool
//! worker:
//!   program: /usr/local/bin/threadwire
//!   args: [worker]
//! ```
//!
//! Values can be overridden from the command line or environment with [`OverridableConfig`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
