//! Error types for the harness.

use std::path::PathBuf;
use std::time::Duration;

/// Why a harness test failed.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The guard timer fired before the test signalled success.
    #[error("test timed out after {timeout:?}")]
    TimedOut {
        /// The configured timeout.
        timeout: Duration,
    },

    /// The loop stopped with a non-zero exit code other than the guard's.
    #[error("event loop exited with code {code}")]
    ExitCode {
        /// The code `run()` returned.
        code: i32,
    },

    /// Work was left behind after the test's cleanup.
    #[error("test leaked {pending_records} queued record(s) and {active_timers} active timer(s)")]
    Leaked {
        /// Records still waiting in the queue.
        pending_records: usize,
        /// Timers still registered.
        active_timers: usize,
    },

    /// The event loop reported an error.
    #[error(transparent)]
    Loop(#[from] signalbox_core::Error),

    /// The test's setup closure failed.
    #[error("setup failed: {0}")]
    Setup(String),

    /// A test body panicked, usually a failed assertion.
    #[error("test panicked: {0}")]
    Panicked(String),

    /// A scenario observed something other than what it expects.
    #[error("unexpected outcome: {0}")]
    Unexpected(String),

    /// The harness configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HarnessError {
    /// Build a setup failure from any displayable error.
    pub fn setup(message: impl std::fmt::Display) -> Self {
        Self::Setup(message.to_string())
    }
}

/// Errors raised while loading a [`HarnessConfig`](crate::HarnessConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The file that was read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value was out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A specialized Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
