//! The timeout guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use signalbox_core::{EventLoop, NodeId, TimerId};

/// A single-shot timer that stops a hung test.
///
/// When it fires, the loop exits with the failure code. The timer belongs to
/// the test's root node, so destroying that node disarms it and a later test
/// on the same loop never sees it.
#[derive(Debug)]
pub struct TimeoutGuard {
    timer: TimerId,
    fired: Arc<AtomicBool>,
}

impl TimeoutGuard {
    /// Arm a guard owned by `root`.
    pub fn arm(
        event_loop: &'static EventLoop,
        root: NodeId,
        timeout: Duration,
        failure_exit_code: i32,
    ) -> signalbox_core::Result<Self> {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let timer = event_loop.single_shot_owned(root, timeout, move || {
            flag.store(true, Ordering::SeqCst);
            tracing::warn!(
                target: "signalbox_harness::guard",
                ?timeout,
                code = failure_exit_code,
                "timeout guard fired"
            );
            event_loop.exit(failure_exit_code);
        })?;
        Ok(Self { timer, fired })
    }

    /// Whether the guard has fired.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// The guard's timer.
    pub fn timer(&self) -> TimerId {
        self.timer
    }
}
