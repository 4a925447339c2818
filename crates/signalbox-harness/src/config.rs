//! Harness configuration.
//!
//! Values come from, in increasing priority: built-in defaults, a TOML file,
//! `SIGNALBOX_*` environment variables, and finally whatever the caller sets
//! (the runner applies its command-line flags last).
//!
//! ```toml
//! timeout_ms = 5000
//! failure_exit_code = -1
//! detect_leaks = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding [`HarnessConfig::timeout_ms`].
pub const ENV_TIMEOUT_MS: &str = "SIGNALBOX_TIMEOUT_MS";
/// Environment variable overriding [`HarnessConfig::failure_exit_code`].
pub const ENV_FAILURE_EXIT_CODE: &str = "SIGNALBOX_FAILURE_EXIT_CODE";

/// How the harness guards and checks each test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// How long a test may run before the guard stops the loop.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Exit code the guard stops the loop with. Must not be 0.
    #[serde(default = "default_failure_exit_code")]
    pub failure_exit_code: i32,

    /// Fail tests that leave queued records or active timers behind.
    #[serde(default = "default_detect_leaks")]
    pub detect_leaks: bool,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_failure_exit_code() -> i32 {
    -1
}

fn default_detect_leaks() -> bool {
    true
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            failure_exit_code: default_failure_exit_code(),
            detect_leaks: default_detect_leaks(),
        }
    }
}

impl HarnessConfig {
    /// Parse a configuration from TOML text. Missing keys take defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content)
    }

    /// Apply `SIGNALBOX_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `SIGNALBOX_*` overrides read through `lookup`.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            self.timeout_ms = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{ENV_TIMEOUT_MS}={raw:?} is not a number")))?;
        }
        if let Some(raw) = lookup(ENV_FAILURE_EXIT_CODE) {
            self.failure_exit_code = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_FAILURE_EXIT_CODE}={raw:?} is not an integer"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be greater than 0".into()));
        }
        if self.failure_exit_code == 0 {
            return Err(ConfigError::Invalid(
                "failure_exit_code must differ from the success code 0".into(),
            ));
        }
        Ok(())
    }

    /// The timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
