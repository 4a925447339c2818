//! The test harness.
//!
//! Each test gets a fresh root node on the thread's event loop. Everything
//! the test owns hangs off that root, including the timeout guard, and is
//! destroyed when the test ends, pass or fail. The loop itself is shared by
//! every test on the thread and is never torn down.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use signalbox_core::{EventLoop, IntoSlotResult, NodeId, PerfSpan, Receiver, TimerId};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::guard::TimeoutGuard;

/// Summary of a passing test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    /// The test's name.
    pub name: String,
    /// The code the loop exited with.
    pub exit_code: i32,
    /// Wall time from setup to the end of cleanup.
    pub elapsed: Duration,
}

/// Handle passed to a test's setup and assertion closures.
#[derive(Clone, Copy)]
pub struct TestContext {
    event_loop: &'static EventLoop,
    root: NodeId,
}

impl TestContext {
    /// The loop the test runs on.
    pub fn event_loop(&self) -> &'static EventLoop {
        self.event_loop
    }

    /// The test's root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The root node as a receiver for connections.
    pub fn receiver(&self) -> Result<Receiver> {
        Ok(self.event_loop.receiver(self.root)?)
    }

    /// Create a node owned by the test root.
    pub fn create_node(&self, name: impl Into<String>) -> Result<NodeId> {
        Ok(self.event_loop.create_child(self.root, name)?)
    }

    /// Run `callback` after `delay_ms`, unless the test ends first.
    pub fn single_shot<F, R>(&self, delay_ms: u64, callback: F) -> Result<TimerId>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoSlotResult,
    {
        Ok(self
            .event_loop
            .single_shot_owned(self.root, Duration::from_millis(delay_ms), callback)?)
    }

    /// Queue `task` on the loop; dropped if the test ends first.
    pub fn post<F, R>(&self, task: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoSlotResult,
    {
        self.event_loop.post_owned(self.root, task);
    }

    /// Stop the loop with success.
    pub fn quit(&self) {
        self.event_loop.quit();
    }

    /// Stop the loop with `code`.
    pub fn exit(&self, code: i32) {
        self.event_loop.exit(code);
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("thread", &self.event_loop.thread_id())
            .field("root", &self.root)
            .finish()
    }
}

/// Runs event-loop tests on the calling thread's loop.
///
/// # Example
///
/// ```
/// use signalbox_harness::{HarnessConfig, TestHarness};
///
/// let harness = TestHarness::new(HarnessConfig::default());
/// let report = harness
///     .run_test(
///         "quits",
///         |ctx| {
///             let event_loop = ctx.event_loop();
///             ctx.post(move || event_loop.quit());
///             Ok(())
///         },
///         |_| {},
///     )
///     .unwrap();
/// assert_eq!(report.exit_code, 0);
/// ```
pub struct TestHarness {
    config: HarnessConfig,
    event_loop: &'static EventLoop,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new(HarnessConfig::default())
    }
}

impl TestHarness {
    /// A harness bound to the calling thread's event loop.
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            event_loop: EventLoop::current(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The shared event loop.
    pub fn event_loop(&self) -> &'static EventLoop {
        self.event_loop
    }

    /// Run a test with the configured timeout.
    ///
    /// See [`run_test_with_timeout`](Self::run_test_with_timeout).
    pub fn run_test<S, A>(&self, name: &str, setup: S, assertions: A) -> Result<TestReport>
    where
        S: FnOnce(&TestContext) -> Result<()>,
        A: FnOnce(&TestContext),
    {
        self.run_test_with_timeout(name, self.config.timeout(), setup, assertions)
    }

    /// Run one test.
    ///
    /// Creates the test root, arms the timeout guard, calls `setup`, runs the
    /// loop until something exits it, checks the exit code, then calls
    /// `assertions`. The root is destroyed afterwards whatever happened. A
    /// panic in either closure is resumed once cleanup is done.
    ///
    /// # Errors
    ///
    /// [`HarnessError::TimedOut`] when the loop stopped with the failure
    /// code, [`HarnessError::ExitCode`] for any other non-zero code,
    /// [`HarnessError::Leaked`] when records or timers outlive the cleanup,
    /// and setup or loop errors as they occur.
    pub fn run_test_with_timeout<S, A>(
        &self,
        name: &str,
        timeout: Duration,
        setup: S,
        assertions: A,
    ) -> Result<TestReport>
    where
        S: FnOnce(&TestContext) -> Result<()>,
        A: FnOnce(&TestContext),
    {
        let _span = PerfSpan::new("harness.run_test");
        let started = Instant::now();
        let root = self.event_loop.create_node(format!("test:{name}"));
        let ctx = TestContext {
            event_loop: self.event_loop,
            root,
        };
        tracing::debug!(target: "signalbox_harness::harness", test = name, ?timeout, "test started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drive(&ctx, timeout, setup, assertions)));
        let cleanup = self.cleanup(root);

        let exit_code = match outcome {
            Ok(result) => result?,
            Err(payload) => panic::resume_unwind(payload),
        };
        cleanup?;
        self.check_leaks()?;

        let elapsed = started.elapsed();
        tracing::debug!(target: "signalbox_harness::harness", test = name, ?elapsed, "test passed");
        Ok(TestReport {
            name: name.to_string(),
            exit_code,
            elapsed,
        })
    }

    fn drive<S, A>(&self, ctx: &TestContext, timeout: Duration, setup: S, assertions: A) -> Result<i32>
    where
        S: FnOnce(&TestContext) -> Result<()>,
        A: FnOnce(&TestContext),
    {
        let guard = TimeoutGuard::arm(ctx.event_loop, ctx.root, timeout, self.config.failure_exit_code)?;
        setup(ctx)?;

        let code = match self.event_loop.run() {
            Ok(code) => code,
            // A hung test that also had failing callbacks is still a timeout.
            Err(signalbox_core::Error::QueuedCallbackFailed {
                exit_code: Some(code),
                failures,
            }) if code == self.config.failure_exit_code => {
                for failure in &failures {
                    tracing::warn!(
                        target: "signalbox_harness::harness",
                        %failure,
                        "queued callback failed before the timeout"
                    );
                }
                code
            }
            Err(e) => return Err(e.into()),
        };
        if code == self.config.failure_exit_code {
            tracing::debug!(
                target: "signalbox_harness::harness",
                guard_fired = guard.fired(),
                "loop stopped with the failure code"
            );
            return Err(HarnessError::TimedOut { timeout });
        }
        if code != 0 {
            return Err(HarnessError::ExitCode { code });
        }

        assertions(ctx);
        Ok(code)
    }

    fn cleanup(&self, root: NodeId) -> Result<()> {
        if self.event_loop.contains(root) {
            self.event_loop.delete_later(root)?;
        }
        self.event_loop.process_deferred_deletions()?;
        Ok(())
    }

    fn check_leaks(&self) -> Result<()> {
        if !self.config.detect_leaks {
            return Ok(());
        }
        let pending_records = self.event_loop.pending_count();
        let active_timers = self.event_loop.active_timer_count();
        if pending_records > 0 || active_timers > 0 {
            return Err(HarnessError::Leaked {
                pending_records,
                active_timers,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestHarness")
            .field("config", &self.config)
            .field("event_loop", self.event_loop)
            .finish()
    }
}
