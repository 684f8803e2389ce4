pub mod paths;
pub mod process_config;

pub use paths::ProjectPaths;
pub use process_config::{ConfigError, LoggingConfig, ProcessConfig};
