//! This module implements the definition of the command line app.

use std::path::PathBuf;

use clap::{Arg, Command, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Threadwire runs methods of workers in parallel threads and processes.";

pub fn make_app() -> Command {
    Command::new("threadwire")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("The path to the config folder."),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .env("THREADWIRE_LOG_LEVEL")
                .help("The log level: off, error, warn, info, debug or trace."),
        )
        .arg(
            Arg::new("log_format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .env("THREADWIRE_LOG_FORMAT")
                .help("The log format: auto, pretty, simplified or json."),
        )
        .arg(
            Arg::new("init_timeout")
                .long("init-timeout")
                .value_name("SECONDS")
                .global(true)
                .env("THREADWIRE_INIT_TIMEOUT")
                .help("Seconds to wait for a worker to announce its methods."),
        )
        .arg(
            Arg::new("worker_program")
                .long("worker-program")
                .value_name("PATH")
                .global(true)
                .env("THREADWIRE_WORKER_PROGRAM")
                .help("The worker executable, defaults to this executable."),
        )
        .subcommand(
            Command::new("worker")
                .about("Serve the demo methods over stdin and stdout")
                .after_help(
                    "This is the entry point of worker processes. It announces the demo \
                     methods on stdout and then answers calls read from stdin until it is \
                     terminated. Logs are written to stderr.",
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Call a method on a pool of worker processes")
                .after_help(
                    "This spawns a pool of worker processes, queues the requested number \
                     of calls on the least loaded workers and prints every result once \
                     all calls have settled.  Arguments that parse as integers are passed \
                     as integers, everything else as strings.",
                )
                .arg(
                    Arg::new("method")
                        .value_name("METHOD")
                        .default_value("helloWorld")
                        .help("The method to call."),
                )
                .arg(
                    Arg::new("args")
                        .value_name("ARGS")
                        .num_args(0..)
                        .help("Arguments passed to every call."),
                )
                .arg(
                    Arg::new("calls")
                        .long("calls")
                        .short('n')
                        .value_name("COUNT")
                        .value_parser(value_parser!(usize))
                        .default_value("1")
                        .help("Number of calls to queue."),
                )
                .arg(
                    Arg::new("pool_size")
                        .long("pool-size")
                        .value_name("SIZE")
                        .env("THREADWIRE_POOL_SIZE")
                        .help("Number of worker processes, defaults to the number of CPUs."),
                )
                .arg(
                    Arg::new("pool_name")
                        .long("pool-name")
                        .value_name("NAME")
                        .help("Name of the pool used in errors and logs."),
                ),
        )
        .subcommand(
            Command::new("methods")
                .about("Print the methods a worker process exposes")
                .after_help(
                    "This spawns a single worker process, waits for it to announce its \
                     methods, prints them and terminates the worker again.",
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"))
}
