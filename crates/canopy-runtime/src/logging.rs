//! Process-wide log output
//!
//! Installed once by the host program. Per-node verbosity is a separate
//! switch, `NodeConfig::debug`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Log output settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `canopy_runtime=debug`
    pub level: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
    /// `RUST_LOG` overrides `level` when set
    pub use_env: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            json: false,
            use_env: true,
        }
    }
}

impl LoggingConfig {
    pub fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if self.use_env {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return Ok(filter);
            }
        }
        EnvFilter::try_new(&self.level).map_err(|e| LoggingError::InvalidFilter(e.to_string()))
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
    } else {
        registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
    }
}
