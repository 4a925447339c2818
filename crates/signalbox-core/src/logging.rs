//! Logging facilities for signalbox.
//!
//! signalbox uses the `tracing` crate for instrumentation and never installs
//! a subscriber itself. To see logs, install one in your binary:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("signalbox_core::event_loop=debug")
//!     .init();
//! ```
//!
//! The [`targets`] constants name every subsystem target so filters can be
//! built without string typos.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "signalbox_core";
    /// Event loop target.
    pub const EVENT_LOOP: &str = "signalbox_core::event_loop";
    /// Timer system target.
    pub const TIMER: &str = "signalbox_core::timer";
    /// Signal/slot system target.
    pub const SIGNAL: &str = "signalbox_core::signal";
    /// Ownership tree target.
    pub const OBJECT: &str = "signalbox_core::object";
    /// Invocation queue target.
    pub const QUEUE: &str = "signalbox_core::queue";
    /// Background worker target.
    pub const WORKER: &str = "signalbox_core::worker";

    /// Every target above, in the order they are listed.
    pub const ALL: &[&str] = &[CORE, EVENT_LOOP, TIMER, SIGNAL, OBJECT, QUEUE, WORKER];
}

/// A guard that keeps a tracing span entered until dropped.
///
/// Useful for tracking the duration of an operation such as one harness test.
#[derive(Debug)]
pub struct PerfSpan {
    _span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Enter a new performance span named `name`.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "signalbox_core::perf", "perf", operation = name);
        Self {
            _span: span.entered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_share_crate_prefix() {
        for target in targets::ALL {
            assert!(target.starts_with(targets::CORE), "{target}");
        }
    }

    #[test]
    fn test_perf_span() {
        // No subscriber installed: entering and dropping must be harmless.
        let _span = PerfSpan::new("test_operation");
    }
}
