use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::info;

use crate::config::paths::ProjectPaths;

pub const MAX_THREAD_POOL_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found")]
    NotFound,
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("IO error reading config: {0}")]
    Io(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_thread_pool_size() -> usize {
    4
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

fn default_max_call_depth() -> usize {
    crate::engine::native::DEFAULT_MAX_CALL_DEPTH
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Also write logs to `<data dir>/logs/<component>.log`
    #[serde(default)]
    pub file_logging: bool,

    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_logging: false,
            filter: default_log_filter(),
        }
    }
}

/// Process-wide options, constructed once and shared by every runtime
/// context through the platform
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Number of worker threads for blocking work
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    /// Treat every uncaught exception as unrecoverable
    #[serde(default)]
    pub abort_on_uncaught_exception: bool,

    /// How long teardown waits for in-flight work
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    /// Ask the bootstrap to break on the first line of user code
    #[serde(default)]
    pub debug_break_first_line: bool,

    /// Where compiled modules are looked up. Defaults to `<data dir>/modules`.
    #[serde(default)]
    pub modules_dir: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: default_thread_pool_size(),
            abort_on_uncaught_exception: false,
            drain_timeout_ms: default_drain_timeout_ms(),
            max_call_depth: default_max_call_depth(),
            debug_break_first_line: false,
            modules_dir: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl ProcessConfig {
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        ProjectPaths::new("hearth")
            .map(|p| p.config_file())
            .ok_or_else(|| ConfigError::Io("Failed to determine config directory".to_string()))
    }

    /// Load from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound);
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: ProcessConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_pool_size == 0 || self.thread_pool_size > MAX_THREAD_POOL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "thread_pool_size must be between 1 and {}, got {}",
                MAX_THREAD_POOL_SIZE, self.thread_pool_size
            )));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_call_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn resolved_modules_dir(&self) -> Option<PathBuf> {
        self.modules_dir
            .clone()
            .or_else(|| ProjectPaths::new("hearth").map(|p| p.modules_dir()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ProcessConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProcessConfig::default());
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.drain_timeout(), Duration::from_secs(1));
        assert!(!config.logging.file_logging);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_partial_file() {
        let config: ProcessConfig = toml::from_str(
            r#"
            thread_pool_size = 8
            abort_on_uncaught_exception = true

            [logging]
            file_logging = true
            "#,
        )
        .unwrap();

        assert_eq!(config.thread_pool_size, 8);
        assert!(config.abort_on_uncaught_exception);
        assert!(config.logging.file_logging);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_validate_thread_pool_size() {
        let mut config = ProcessConfig::default();
        config.thread_pool_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.thread_pool_size = MAX_THREAD_POOL_SIZE + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.thread_pool_size = MAX_THREAD_POOL_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessConfig::load_from(&dir.path().join("config.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound)));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "thread_pool_size = \"many\"").unwrap();
        assert!(matches!(
            ProcessConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "thread_pool_size = 2\ndrain_timeout_ms = 50\n").unwrap();
        let config = ProcessConfig::load_from(&path).unwrap();
        assert_eq!(config.thread_pool_size, 2);
        assert_eq!(config.drain_timeout(), Duration::from_millis(50));

        fs::write(&path, "max_call_depth = 0\n").unwrap();
        assert!(matches!(
            ProcessConfig::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
