use std::backtrace::Backtrace;
use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

/// All crates of this workspace. These log at the configured level, everything else at `warn`.
const CRATE_NAMES: &[&str] = &[
    "threadwire",
    "threadwire_channel",
    "threadwire_config",
    "threadwire_protocol",
    "threadwire_threading",
    "threadwire_worker",
];

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  threadwire::cli > spawned pool of 4 threads
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2020-12-04T12:10:32Z  INFO threadwire::cli: spawned pool of 4 threads
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2020-12-04T12:11:08.729716Z","level":"INFO","fields":{"message":"spawned pool of 4 threads"},"target":"threadwire::cli"}
    /// ```
    Json,
}

/// The maximum level at which threadwire crates log.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Logging is disabled.
    Off,
    /// Only errors.
    Error,
    /// Warnings and above.
    Warn,
    /// Informational messages and above.
    Info,
    /// Debug messages and above.
    Debug,
    /// Everything.
    Trace,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        })
    }
}

/// Error returned when parsing an unknown [`Level`].
#[derive(Clone, Copy, Debug)]
pub struct ParseLevelError;

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid log level, expected one of off, error, warn, info, debug, trace")
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "off" => Self::Off,
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return Err(ParseLevelError),
        })
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for threadwire.
    pub level: Level,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, a backtrace is logged for every panic.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Builds the default filter: `warn` for third-party crates and the configured level for ours.
fn default_filter(level: Level) -> EnvFilter {
    let mut directives = String::from("warn");
    for name in CRATE_NAMES {
        directives.push_str(&format!(",{name}={level}"));
    }

    EnvFilter::builder().parse_lossy(directives)
}

/// Initialize the logging system.
///
/// The `RUST_LOG` environment variable takes precedence over the configured level if it is set.
/// Calling this more than once has no effect.
///
/// # Example
///
/// ```
/// let log_config = threadwire_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// threadwire_log::init(&log_config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_hook(info);
            tracing::error!("panic backtrace:\n{}", Backtrace::force_capture());
        }));
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));

    let format = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(true);

    let format = match (config.format, console::user_attended_stderr()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => format.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            format.with_ansi(false).compact().boxed()
        }
        (LogFormat::Json, _) => format
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(format.with_filter(filter))
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: LogConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.level, Level::Info);
        assert_eq!(config.format, LogFormat::Auto);
        assert!(!config.enable_backtraces);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: LogConfig = serde_yaml::from_str("level: trace\nformat: json\n").unwrap();
        assert_eq!(config.level, Level::Trace);
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!("DEBUG".parse::<Level>().unwrap(), Level::Debug);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_level_round_trip() {
        for level in [Level::Off, Level::Warn, Level::Trace] {
            assert_eq!(level.to_string().parse::<Level>().unwrap(), level);
        }
    }
}
