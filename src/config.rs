//! Server-wide configuration, loaded once at startup from
//! `<config_dir>/config.json`. Grounded on the teacher's
//! `ServerConfig`/`Config` split and `PathContext` error-context idiom
//! (`src/config.rs`), trimmed to the knobs this crate actually has: a log
//! level and a worker pool size, since everything scope-shaped now lives
//! in the per-scope `.scope` files the admin CLI and maintenance sweep
//! already manage.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

/// Environment variable that overrides `config.json`'s `log_level`,
/// without requiring a rewrite of the file for a one-off debug session.
pub const LOG_LEVEL_ENV_VAR: &str = "DHCP4D_LOG";

pub struct Config {
    pub log_level: tracing::Level,
    pub worker_threads: usize,
}

#[derive(Deserialize)]
struct ServerConfig {
    log_level: Option<String>,
    #[serde(default)]
    worker_threads: Option<usize>,
}

#[derive(Debug)]
pub enum ConfigError {
    Parsing { err: serde_json::Error, path: PathBuf },
    Io { err: std::io::Error, path: PathBuf },
    LogLevel(String),
}

trait PathContext<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError>;
}

impl<T> PathContext<T> for serde_json::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Parsing { err: e, path: path.as_ref().to_path_buf() })
    }
}

impl<T> PathContext<T> for std::io::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Io { err: e, path: path.as_ref().to_path_buf() })
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parsing { err, path } => write!(f, "parsing `{}`: {err}", path.to_string_lossy()),
            ConfigError::Io { err, path } => write!(f, "`{}`: {err}", path.to_string_lossy()),
            ConfigError::LogLevel(value) => write!(
                f,
                r#"unexpected log level "{value}"; expected one of [trace, debug, info, warn, error]"#
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Config { log_level: tracing::Level::INFO, worker_threads: 8 }
    }
}

impl Config {
    /// Loads `config.json` from `config_dir`. `DHCP4D_LOG`, when set,
    /// wins over the file's `log_level` field.
    pub fn load_from_files<P: AsRef<Path>>(config_dir: P) -> Result<Config, ConfigError> {
        let path = config_dir.as_ref().join("config.json");
        let server_config: ServerConfig =
            serde_json::from_reader(std::fs::File::open(&path).context(&path)?).context(&path)?;

        let level_str = std::env::var(LOG_LEVEL_ENV_VAR).ok().or(server_config.log_level);
        let log_level = match level_str {
            Some(s) if !s.is_empty() => tracing::Level::from_str(&s).map_err(|_| ConfigError::LogLevel(s))?,
            _ => tracing::Level::INFO,
        };

        Ok(Config {
            log_level,
            worker_threads: server_config.worker_threads.unwrap_or(8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_log_level_and_worker_threads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("config.json")).unwrap();
        write!(file, r#"{{"log_level": "debug", "worker_threads": 4}}"#).unwrap();
        let config = Config::load_from_files(dir.path()).unwrap();
        assert_eq!(config.log_level, tracing::Level::DEBUG);
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_files(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("config.json")).unwrap();
        write!(file, r#"{{"log_level": "verbose"}}"#).unwrap();
        let err = Config::load_from_files(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::LogLevel(_)));
    }
}
