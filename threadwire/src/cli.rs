use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::ArgMatches;
use threadwire_channel::process;
use threadwire_config::{Config, OverridableConfig};
use threadwire_protocol::{Payload, Value};
use threadwire_threading::{Thread, ThreadOptions, ThreadPool};
use tokio::process::Command;
use tokio::runtime::Runtime;

use crate::cliapp::make_app;
use crate::{demo, setup};

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();
    let config = load_config(&matches)?;

    threadwire_log::init(config.logging());
    setup::dump_spawn_infos(&config);

    match matches.subcommand() {
        Some(("worker", _)) => worker(),
        Some(("run", matches)) => run(&config, matches),
        Some(("methods", _)) => methods(&config),
        Some(("config", _)) => show_config(&config),
        _ => unreachable!(),
    }
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let path = matches
        .get_one::<PathBuf>("config")
        .map_or(Path::new("."), PathBuf::as_path);

    let mut config = Config::from_path(path)?;
    config.apply_override(extract_config_args(matches))?;
    Ok(config)
}

/// Extracts configuration overrides from the command line and environment.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let (pool_size, pool_name) = match matches.subcommand() {
        Some(("run", matches)) => (
            matches.get_one::<String>("pool_size").cloned(),
            matches.get_one::<String>("pool_name").cloned(),
        ),
        _ => (None, None),
    };

    OverridableConfig {
        log_level: matches.get_one::<String>("log_level").cloned(),
        log_format: matches.get_one::<String>("log_format").cloned(),
        init_timeout: matches.get_one::<String>("init_timeout").cloned(),
        pool_size,
        pool_name,
        worker_program: matches.get_one::<String>("worker_program").cloned(),
    }
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

/// Parses a command line argument into a call argument.
fn parse_arg(arg: &str) -> Value {
    match arg.parse::<i64>() {
        Ok(int) => Value::Int(int),
        Err(_) => Value::from(arg),
    }
}

/// Returns a function that builds the command for one worker process.
fn worker_command(config: &Config) -> Result<impl Fn() -> Command + Send + Sync + 'static> {
    let program = match config.worker_program() {
        Some(program) => program.to_path_buf(),
        None => std::env::current_exe().context("failed to locate the threadwire executable")?,
    };
    let args = config.worker_args().to_vec();

    Ok(move || {
        let mut command = Command::new(&program);
        command.args(&args);
        command
    })
}

fn worker() -> Result<()> {
    let runtime = runtime()?;
    let result = runtime.block_on(threadwire_worker::expose_stdio(demo::api()));

    // The blocking stdin reader cannot be cancelled.
    runtime.shutdown_background();
    result.context("worker failed")
}

#[allow(clippy::print_stdout)]
fn run(config: &Config, matches: &ArgMatches) -> Result<()> {
    let method = matches
        .get_one::<String>("method")
        .map_or("helloWorld", String::as_str);
    let args: Vec<Value> = matches
        .get_many::<String>("args")
        .into_iter()
        .flatten()
        .map(|arg| parse_arg(arg))
        .collect();
    let calls = matches.get_one::<usize>("calls").copied().unwrap_or(1);

    let command = worker_command(config)?;
    let options = ThreadOptions {
        init_timeout: config.init_timeout(),
    };

    runtime()?.block_on(async move {
        let pool = ThreadPool::builder(move |_| {
            let channel = process::spawn(command());
            let options = options.clone();
            async move { Thread::spawn(channel?, options).await }
        })
        .size(config.pool_size())
        .name(config.pool_name())
        .spawn()
        .await?;

        let started = Instant::now();
        let handles: Vec<_> = (0..calls)
            .map(|_| {
                let args = args.iter().cloned().map(Payload::from).collect();
                pool.queue(|thread| thread.call(method, args))
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let elapsed = started.elapsed();

        let mut succeeded = 0;
        for (index, result) in results.iter().enumerate() {
            match result {
                Ok(value) => {
                    succeeded += 1;
                    println!("call #{index}: {value:?}");
                }
                Err(error) => println!("call #{index} failed: {error}"),
            }
        }
        println!("{method}: {succeeded}/{calls} calls succeeded in {elapsed:?}");

        pool.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    })
}

#[allow(clippy::print_stdout)]
fn methods(config: &Config) -> Result<()> {
    let command = worker_command(config)?;
    let options = ThreadOptions {
        init_timeout: config.init_timeout(),
    };

    runtime()?.block_on(async move {
        let channel = process::spawn(command()).context("failed to start worker process")?;
        let thread = Thread::spawn(channel, options).await?;

        for name in thread.methods().names() {
            println!("{name}");
        }

        thread.terminate(false).await?;
        Ok::<_, anyhow::Error>(())
    })
}

#[allow(clippy::print_stdout)]
fn show_config(config: &Config) -> Result<()> {
    print!("{}", config.to_yaml_string()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), Value::Int(42));
        assert_eq!(parse_arg("-1"), Value::Int(-1));
        assert_eq!(parse_arg("4.2"), Value::from("4.2"));
    }

    #[test]
    fn test_overrides_from_args() {
        let matches = make_app()
            .try_get_matches_from([
                "threadwire",
                "--log-level",
                "debug",
                "run",
                "--pool-size",
                "3",
                "echo",
                "1",
                "x",
            ])
            .unwrap();

        let overrides = extract_config_args(&matches);
        assert_eq!(overrides.log_level.as_deref(), Some("debug"));
        assert_eq!(overrides.pool_size.as_deref(), Some("3"));
        assert_eq!(overrides.pool_name, None);

        let (_, run) = matches.subcommand().unwrap();
        let args: Vec<_> = run.get_many::<String>("args").unwrap().collect();
        assert_eq!(args, ["1", "x"]);
    }

    #[test]
    fn test_app_is_valid() {
        make_app().debug_assert();
    }
}
