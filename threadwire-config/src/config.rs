use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use threadwire_log::{Level, LogConfig, LogFormat};

/// The name of the config file within the config folder.
const CONFIG_FILE: &str = "config.yml";

/// Defines the source of a config error.
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env variable, or a CLI parameter).
    FieldOverride(&'static str),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => fmt::Display::fmt(&self.kind, f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Error for a numeric config value that must be positive.
#[derive(Debug, thiserror::Error)]
#[error("value must be greater than zero")]
struct ZeroValue;

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The log level.
    pub log_level: Option<String>,
    /// The log format.
    pub log_format: Option<String>,
    /// Seconds to wait for the init message of a worker.
    pub init_timeout: Option<String>,
    /// Number of threads in a pool.
    pub pool_size: Option<String>,
    /// Name of the pool used in errors and logs.
    pub pool_name: Option<String>,
    /// Path to the worker executable.
    pub worker_program: Option<String>,
}

/// Settings for individual threads.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Threads {
    /// Seconds to wait for a worker's init message before spawning fails.
    init_timeout: u64,
}

impl Default for Threads {
    fn default() -> Self {
        Self { init_timeout: 10 }
    }
}

/// Settings for thread pools.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Pool {
    /// Number of threads, defaults to the number of CPUs.
    size: Option<usize>,
    /// Name of the pool.
    name: String,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            size: None,
            name: "ThreadPool".to_owned(),
        }
    }
}

/// The command used to start process-backed workers.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Worker {
    /// Path to the worker executable, defaults to the running executable.
    program: Option<PathBuf>,
    /// Arguments passed to the worker executable.
    args: Vec<String>,
}

impl Default for Worker {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".to_owned()],
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    threads: Threads,
    pool: Pool,
    worker: Worker,
}

impl ConfigValues {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.threads.init_timeout == 0 {
            return Err(ConfigError::for_field(ZeroValue, "threads.init_timeout"));
        }

        if self.pool.size == Some(0) {
            return Err(ConfigError::for_field(ZeroValue, "pool.size"));
        }

        Ok(())
    }
}

/// Config struct.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// If the folder does not contain a config file, the default configuration is used.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let file = path.join(CONFIG_FILE);

        let values = match fs::read_to_string(&file) {
            Ok(contents) => serde_yaml::from_str::<ConfigValues>(&contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&file))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                threadwire_log::debug!("no config file at {}, using defaults", file.display());
                ConfigValues::default()
            }
            Err(e) => {
                return Err(ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&file));
            }
        };

        values.validate().map_err(|e| e.file(&file))?;

        Ok(Config { values, path })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<Level>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(format) = overrides.log_format {
            self.values.logging.format = serde_yaml::from_str::<LogFormat>(&format)
                .map_err(|err| ConfigError::for_field(err, "log_format"))?;
        }

        if let Some(timeout) = overrides.init_timeout {
            let timeout = timeout
                .parse::<u64>()
                .map_err(|err| ConfigError::for_field(err, "init_timeout"))?;
            if timeout == 0 {
                return Err(ConfigError::for_field(ZeroValue, "init_timeout"));
            }
            self.values.threads.init_timeout = timeout;
        }

        if let Some(size) = overrides.pool_size {
            let size = size
                .parse::<usize>()
                .map_err(|err| ConfigError::for_field(err, "pool_size"))?;
            if size == 0 {
                return Err(ConfigError::for_field(ZeroValue, "pool_size"));
            }
            self.values.pool.size = Some(size);
        }

        if let Some(name) = overrides.pool_name {
            if name.is_empty() {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("pool_name"));
            }
            self.values.pool.name = name;
        }

        if let Some(program) = overrides.worker_program {
            self.values.worker.program = Some(PathBuf::from(program));
        }

        Ok(self)
    }

    /// Returns the folder this config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes the effective configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue))
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns how long to wait for a worker's init message.
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.values.threads.init_timeout)
    }

    /// Returns the number of threads in a pool.
    pub fn pool_size(&self) -> usize {
        self.values.pool.size.unwrap_or_else(num_cpus::get)
    }

    /// Returns the name of the pool.
    pub fn pool_name(&self) -> &str {
        &self.values.pool.name
    }

    /// Returns the explicitly configured worker executable, if any.
    pub fn worker_program(&self) -> Option<&Path> {
        self.values.worker.program.as_deref()
    }

    /// Returns the arguments for the worker executable.
    pub fn worker_args(&self) -> &[String] {
        &self.values.worker.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), contents).unwrap();
        dir
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();

        assert_eq!(config.init_timeout(), Duration::from_secs(10));
        assert_eq!(config.pool_size(), num_cpus::get());
        assert_eq!(config.pool_name(), "ThreadPool");
        assert_eq!(config.worker_program(), None);
        assert_eq!(config.worker_args(), ["worker"]);
    }

    #[test]
    fn test_load_sections() {
        let dir = write_config(
            "threads:\n  init_timeout: 3\npool:\n  size: 2\n  name: Renderers\nworker:\n  program: /bin/worker\n  args: []\n",
        );
        let config = Config::from_path(dir.path()).unwrap();

        assert_eq!(config.init_timeout(), Duration::from_secs(3));
        assert_eq!(config.pool_size(), 2);
        assert_eq!(config.pool_name(), "Renderers");
        assert_eq!(config.worker_program(), Some(Path::new("/bin/worker")));
        assert!(config.worker_args().is_empty());
    }

    #[test]
    fn test_bad_yaml() {
        let dir = write_config("pool: [");
        let error = Config::from_path(dir.path()).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.to_string().starts_with("could not parse yaml config file (file "));
    }

    #[test]
    fn test_zero_pool_size_in_file() {
        let dir = write_config("pool:\n  size: 0\n");
        let error = Config::from_path(dir.path()).unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                log_level: Some("debug".to_owned()),
                log_format: Some("json".to_owned()),
                pool_size: Some("3".to_owned()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.logging().level, Level::Debug);
        assert_eq!(config.logging().format, LogFormat::Json);
        assert_eq!(config.pool_size(), 3);
    }

    #[test]
    fn test_invalid_override_names_field() {
        let mut config = Config::default();
        let error = config
            .apply_override(OverridableConfig {
                pool_size: Some("many".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        insta::assert_snapshot!(error, @"invalid config value (field pool_size)");
    }

    #[test]
    fn test_zero_timeout_override() {
        let mut config = Config::default();
        let error = config
            .apply_override(OverridableConfig {
                init_timeout: Some("0".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        insta::assert_snapshot!(error, @"invalid config value (field init_timeout)");
    }
}
