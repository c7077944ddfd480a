//! Broker configuration
//!
//! Timeouts and the wait-multiplex bound. Loadable from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default bound on every registration wait (20 seconds)
const DEFAULT_REGISTRATION_TIMEOUT_MS: u64 = 20_000;

/// Default bound on waiting for the watcher to exit (20 seconds)
const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 20_000;

/// Default number of waitable objects per watcher cycle, control slots included
pub const DEFAULT_WAIT_BOUND: usize = 64;

/// Slots reserved in every watcher cycle for the update and terminate signals
pub const CONTROL_SLOTS: usize = 2;

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long a caller waits for a pending registration to complete
    pub registration_timeout_ms: u64,
    /// How long `terminate` waits for the watcher thread to exit
    pub terminate_timeout_ms: u64,
    /// Maximum waitable objects in one watcher cycle (including control slots)
    pub wait_bound: usize,
    /// Start the watcher thread when the registry is built
    pub spawn_watcher: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            registration_timeout_ms: DEFAULT_REGISTRATION_TIMEOUT_MS,
            terminate_timeout_ms: DEFAULT_TERMINATE_TIMEOUT_MS,
            wait_bound: DEFAULT_WAIT_BOUND,
            spawn_watcher: true,
        }
    }
}

impl BrokerConfig {
    /// No watcher thread and short timeouts, for lock-step tests
    pub fn lock_step() -> Self {
        Self {
            registration_timeout_ms: 50,
            terminate_timeout_ms: 1_000,
            wait_bound: DEFAULT_WAIT_BOUND,
            spawn_watcher: false,
        }
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    /// Number of threads one watcher cycle can observe.
    pub fn watch_capacity(&self) -> usize {
        self.wait_bound.saturating_sub(CONTROL_SLOTS)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_bound <= CONTROL_SLOTS {
            return Err(ConfigError::WaitBoundTooSmall(self.wait_bound));
        }
        if self.registration_timeout_ms == 0 || self.terminate_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Wait bound {0} leaves no room for watched threads")]
    WaitBoundTooSmall(usize),

    #[error("Timeouts must be non-zero")]
    ZeroTimeout,
}
