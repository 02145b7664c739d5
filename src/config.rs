//! Server configuration
//!
//! Settings come from three places, later ones winning:
//!
//! ```text
//!   defaults  ──>  RAVENKV_* environment  ──>  command-line flags
//! ```
//!
//! | flag                    | environment              | default          |
//! |-------------------------|--------------------------|------------------|
//! | `-h`, `--host`          | `RAVENKV_HOST`           | `127.0.0.1`      |
//! | `-p`, `--port`          | `RAVENKV_PORT`           | `6379`           |
//! | `--databases`           | `RAVENKV_DATABASES`      | `16`             |
//! | `--shards`              | `RAVENKV_SHARDS`         | `16`             |
//! | `--expiry-interval-ms`  | `RAVENKV_EXPIRY_INTERVAL_MS` | `100`        |
//! | `--appendonly`          | `RAVENKV_APPENDONLY`     | `no`             |
//! | `--appendfilename`      | `RAVENKV_APPENDFILENAME` | `appendonly.aof` |
//! | `--appendfsync`         | `RAVENKV_APPENDFSYNC`    | `everysec`       |
//! | `--max-request-bytes`   | `RAVENKV_MAX_REQUEST_BYTES` | `8388608`     |

use crate::aof::FsyncPolicy;
use crate::connection::DEFAULT_MAX_REQUEST_SIZE;
use crate::database::DatabaseConfig;
use crate::storage::{DEFAULT_SHARD_COUNT, DEFAULT_TICK_INTERVAL};
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DATABASES: usize = 16;
pub const DEFAULT_APPEND_FILENAME: &str = "appendonly.aof";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value '{value}' for {option}")]
    InvalidValue { option: String, value: String },

    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub databases: usize,
    pub shard_count: usize,
    pub expiry_interval: Duration,
    pub append_only: bool,
    pub append_filename: PathBuf,
    pub append_fsync: FsyncPolicy,
    /// Unparsed bytes a client may accumulate before it is disconnected.
    pub max_request_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            databases: DEFAULT_DATABASES,
            shard_count: DEFAULT_SHARD_COUNT,
            expiry_interval: DEFAULT_TICK_INTERVAL,
            append_only: false,
            append_filename: PathBuf::from(DEFAULT_APPEND_FILENAME),
            append_fsync: FsyncPolicy::EverySec,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run(Config),
    Help,
    Version,
}

impl Config {
    /// Reads the process environment and arguments.
    pub fn load() -> Result<Invocation, ConfigError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::from_sources(&args, |name| std::env::var(name).ok())
    }

    /// Builds a configuration from `args` (without the program name) layered
    /// over whatever `env` returns for the `RAVENKV_*` variables.
    pub fn from_sources<F>(args: &[String], env: F) -> Result<Invocation, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        for (name, option) in ENV_OPTIONS {
            if let Some(value) = env(name) {
                config.apply(option, &value)?;
            }
        }

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" => return Ok(Invocation::Help),
                "--version" | "-v" => return Ok(Invocation::Version),
                _ => {}
            }
            let option = match flag {
                "--host" | "-h" => "--host",
                "--port" | "-p" => "--port",
                "--databases" | "--shards" | "--expiry-interval-ms" | "--appendonly"
                | "--appendfilename" | "--appendfsync" | "--max-request-bytes" => flag,
                _ => return Err(ConfigError::UnknownArgument(flag.to_string())),
            };
            let value = args
                .get(i + 1)
                .ok_or_else(|| ConfigError::MissingValue(option.to_string()))?;
            config.apply(option, value)?;
            i += 2;
        }

        Ok(Invocation::Run(config))
    }

    fn apply(&mut self, option: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
        };
        match option {
            "--host" => self.host = value.to_string(),
            "--port" => self.port = value.parse().map_err(|_| invalid())?,
            "--databases" => {
                self.databases = value
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?
            }
            "--shards" => {
                self.shard_count = value
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?
            }
            "--expiry-interval-ms" => {
                let ms: u64 = value.parse().ok().filter(|n| *n > 0).ok_or_else(invalid)?;
                self.expiry_interval = Duration::from_millis(ms);
            }
            "--appendonly" => {
                self.append_only = match value.to_ascii_lowercase().as_str() {
                    "yes" | "true" | "1" => true,
                    "no" | "false" | "0" => false,
                    _ => return Err(invalid()),
                }
            }
            "--appendfilename" => self.append_filename = PathBuf::from(value),
            "--appendfsync" => self.append_fsync = value.parse().map_err(|_| invalid())?,
            "--max-request-bytes" => {
                self.max_request_size = value
                    .parse()
                    .ok()
                    .filter(|n| *n >= MIN_REQUEST_SIZE)
                    .ok_or_else(invalid)?
            }
            _ => return Err(ConfigError::UnknownArgument(option.to_string())),
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            shard_count: self.shard_count,
            expiry_tick: self.expiry_interval,
        }
    }
}

/// Smallest accepted `--max-request-bytes`.
const MIN_REQUEST_SIZE: usize = 1024;

const ENV_OPTIONS: [(&str, &str); 9] = [
    ("RAVENKV_HOST", "--host"),
    ("RAVENKV_PORT", "--port"),
    ("RAVENKV_DATABASES", "--databases"),
    ("RAVENKV_SHARDS", "--shards"),
    ("RAVENKV_EXPIRY_INTERVAL_MS", "--expiry-interval-ms"),
    ("RAVENKV_APPENDONLY", "--appendonly"),
    ("RAVENKV_APPENDFILENAME", "--appendfilename"),
    ("RAVENKV_APPENDFSYNC", "--appendfsync"),
    ("RAVENKV_MAX_REQUEST_BYTES", "--max-request-bytes"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn run(invocation: Result<Invocation, ConfigError>) -> Config {
        match invocation {
            Ok(Invocation::Run(config)) => config,
            other => panic!("expected a run configuration, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = run(Config::from_sources(&[], no_env));
        assert_eq!(config, Config::default());
        assert_eq!(config.bind_address(), "127.0.0.1:6379");
        assert_eq!(config.databases, 16);
        assert_eq!(config.expiry_interval, Duration::from_millis(100));
        assert!(!config.append_only);
        assert_eq!(config.append_fsync, FsyncPolicy::EverySec);
        assert_eq!(config.max_request_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_request_size_limit() {
        let config = run(Config::from_sources(
            &args(&["--max-request-bytes", "65536"]),
            no_env,
        ));
        assert_eq!(config.max_request_size, 65536);

        let env = |name: &str| (name == "RAVENKV_MAX_REQUEST_BYTES").then(|| "4096".to_string());
        assert_eq!(run(Config::from_sources(&[], env)).max_request_size, 4096);

        assert!(matches!(
            Config::from_sources(&args(&["--max-request-bytes", "10"]), no_env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_flags() {
        let config = run(Config::from_sources(
            &args(&[
                "-h",
                "0.0.0.0",
                "--port",
                "7000",
                "--databases",
                "4",
                "--appendonly",
                "yes",
                "--appendfilename",
                "/tmp/raven.aof",
                "--appendfsync",
                "always",
                "--expiry-interval-ms",
                "25",
            ]),
            no_env,
        ));
        assert_eq!(config.bind_address(), "0.0.0.0:7000");
        assert_eq!(config.databases, 4);
        assert!(config.append_only);
        assert_eq!(config.append_filename, PathBuf::from("/tmp/raven.aof"));
        assert_eq!(config.append_fsync, FsyncPolicy::Always);
        assert_eq!(config.database_config().expiry_tick, Duration::from_millis(25));
    }

    #[test]
    fn test_flags_override_environment() {
        let env: HashMap<&str, &str> = [("RAVENKV_PORT", "7001"), ("RAVENKV_APPENDONLY", "yes")]
            .into_iter()
            .collect();
        let lookup = |name: &str| env.get(name).map(|v| v.to_string());

        let config = run(Config::from_sources(&[], lookup));
        assert_eq!(config.port, 7001);
        assert!(config.append_only);

        let config = run(Config::from_sources(&args(&["-p", "7002"]), lookup));
        assert_eq!(config.port, 7002);
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(
            Config::from_sources(&args(&["--help"]), no_env),
            Ok(Invocation::Help)
        );
        assert_eq!(
            Config::from_sources(&args(&["-p", "1", "--version"]), no_env),
            Ok(Invocation::Version)
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            Config::from_sources(&args(&["--port"]), no_env),
            Err(ConfigError::MissingValue("--port".into()))
        );
        assert_eq!(
            Config::from_sources(&args(&["--port", "99999"]), no_env),
            Err(ConfigError::InvalidValue {
                option: "--port".into(),
                value: "99999".into()
            })
        );
        assert_eq!(
            Config::from_sources(&args(&["--databases", "0"]), no_env),
            Err(ConfigError::InvalidValue {
                option: "--databases".into(),
                value: "0".into()
            })
        );
        assert!(matches!(
            Config::from_sources(&args(&["--appendfsync", "sometimes"]), no_env),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            Config::from_sources(&args(&["--verbose"]), no_env),
            Err(ConfigError::UnknownArgument("--verbose".into()))
        );

        let bad_env = |name: &str| (name == "RAVENKV_APPENDONLY").then(|| "maybe".to_string());
        assert!(matches!(
            Config::from_sources(&[], bad_env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
