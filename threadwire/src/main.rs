//! The threadwire command line.
//!
//! Threadwire calls methods of workers that run in their own threads or processes. This binary
//! serves two roles: it is a worker process serving a set of demo methods over its standard input
//! and output, and it is a controller that spawns pools of such worker processes and calls them.
//!
//! # Usage
//!
//! ```text
//! threadwire run helloWorld --calls 8 --pool-size 4
//! threadwire run sum 1 2 3
//! threadwire methods
//! threadwire config
//! ```
//!
//! # Configuration
//!
//! Settings are read from `config.yml` in the folder passed with `--config`, or the current
//! directory. Command line arguments and `THREADWIRE_*` environment variables take precedence.
//! See [`threadwire_config`] for all options.

mod cli;
mod cliapp;
mod demo;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            threadwire_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
