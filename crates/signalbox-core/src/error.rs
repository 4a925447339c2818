//! Error types for signalbox.

use std::fmt;
use std::thread::ThreadId;

/// A failure raised by a slot, timer callback or posted task.
///
/// Failures come either from a callback returning `Err` or from a panic
/// caught while delivering a queued invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure {
    /// Where the callback came from (signal name, timer, posted task).
    pub origin: String,
    /// The error message or panic payload.
    pub message: String,
}

impl CallbackFailure {
    /// Create a new failure record.
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.message)
    }
}

impl std::error::Error for CallbackFailure {}

/// The main error type for signalbox operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `run()` was called on a loop that is already running.
    #[error("event loop is already running")]
    AlreadyRunning,

    /// A loop-affine operation was attempted from a foreign thread.
    #[error("event loop belongs to thread {owner:?} but was driven from {current:?}")]
    WrongThread {
        /// The thread that owns the loop.
        owner: ThreadId,
        /// The thread that attempted the operation.
        current: ThreadId,
    },

    /// Reparenting would make a node its own descendant.
    #[error("cannot make a node its own parent or ancestor")]
    CycleDetected,

    /// The node ID is invalid or the node has been destroyed.
    #[error("invalid or destroyed node")]
    InvalidNode,

    /// The timer ID is unknown or the timer has already finished.
    #[error("invalid or finished timer")]
    InvalidTimer,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A direct slot failed during `emit`.
    #[error("callback failed: {0}")]
    CallbackFailure(#[from] CallbackFailure),

    /// One or more queued callbacks failed while the loop was processing.
    ///
    /// `exit_code` is the code `run()` stopped with, or `None` when the
    /// failures were collected by `process_events()`.
    #[error("{} queued callback(s) failed (exit code {exit_code:?}), first: {}", .failures.len(), first_failure(.failures))]
    QueuedCallbackFailed {
        /// The loop's exit code, if the failures were collected by `run()`.
        exit_code: Option<i32>,
        /// Every failure, in delivery order.
        failures: Vec<CallbackFailure>,
    },
}

fn first_failure(failures: &[CallbackFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<none>".to_string())
}

/// A specialized Result type for signalbox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_failure_display() {
        let failure = CallbackFailure::new("signal `clicked`", "boom");
        assert_eq!(failure.to_string(), "signal `clicked`: boom");

        let err: Error = failure.into();
        assert!(matches!(err, Error::CallbackFailure(_)));
        assert_eq!(err.to_string(), "callback failed: signal `clicked`: boom");
    }

    #[test]
    fn test_queued_failure_display_names_first_failure() {
        let err = Error::QueuedCallbackFailed {
            exit_code: Some(0),
            failures: vec![
                CallbackFailure::new("timer", "first"),
                CallbackFailure::new("posted task", "second"),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 queued callback(s) failed"));
        assert!(text.contains("timer: first"));
    }
}
