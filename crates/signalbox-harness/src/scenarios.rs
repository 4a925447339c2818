//! The built-in scenario suite run by `signalbox-run`.
//!
//! Each scenario drives one or more harness tests. The parameterized
//! functions are public so tests can run them with shorter delays.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use signalbox_core::invocation::panic_message;
use signalbox_core::{ConnectionType, Signal, Worker, WorkerConfig};

use crate::error::{HarnessError, Result};
use crate::harness::{TestHarness, TestReport};
use crate::recorder::CallRecorder;

/// Delay before the success timer of the sequential scenario fires.
pub const SEQUENTIAL_SUCCESS_AFTER: Duration = Duration::from_secs(3);

/// Results the worker scenario expects.
pub const WORKER_RESULT_COUNT: usize = 20;

/// A named entry of the suite.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    /// Short identifier, matched by `--filter`.
    pub name: &'static str,
    /// One-line summary.
    pub description: &'static str,
    /// Runs the scenario's tests.
    pub run: fn(&TestHarness) -> Result<Vec<TestReport>>,
}

/// Every built-in scenario, in run order.
pub static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "queued-emit-before-run",
        description: "a queued emit made before run() is delivered, then a queued quit exits 0",
        run: queued_emit_before_run,
    },
    Scenario {
        name: "sequential-tests",
        description: "two tests share the loop; the first test's guard never reaches the second",
        run: |harness| sequential_tests(harness, SEQUENTIAL_SUCCESS_AFTER),
    },
    Scenario {
        name: "worker-results",
        description: "a worker thread emits results through queued connections, finished quits",
        run: |harness| worker_results(harness, WORKER_RESULT_COUNT),
    },
    Scenario {
        name: "guard-timeout",
        description: "a test whose success never arrives is stopped by the guard",
        run: guard_timeout,
    },
];

/// The result of one scenario.
#[derive(Debug)]
pub struct ScenarioResult {
    /// The scenario's name.
    pub name: &'static str,
    /// Reports of the tests it ran, or why it failed.
    pub outcome: Result<Vec<TestReport>>,
    /// Wall time of the whole scenario.
    pub elapsed: Duration,
}

impl ScenarioResult {
    /// Whether the scenario passed.
    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Run one scenario, turning a panic into [`HarnessError::Panicked`].
pub fn run_scenario(harness: &TestHarness, scenario: &Scenario) -> ScenarioResult {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (scenario.run)(harness)))
        .unwrap_or_else(|payload| Err(HarnessError::Panicked(panic_message(payload.as_ref()))));
    ScenarioResult {
        name: scenario.name,
        outcome,
        elapsed: started.elapsed(),
    }
}

/// Scenarios whose name contains `filter`, or all of them.
pub fn select(filter: Option<&str>) -> Vec<&'static Scenario> {
    SCENARIOS
        .iter()
        .filter(|scenario| filter.is_none_or(|f| scenario.name.contains(f)))
        .collect()
}

/// A queued emission made before `run()` is delivered once the loop starts.
pub fn queued_emit_before_run(harness: &TestHarness) -> Result<Vec<TestReport>> {
    let message = Signal::<String>::named("message");
    let done = Signal::<()>::named("done");
    let recorder = CallRecorder::<String>::new();
    let loop_thread = harness.event_loop().thread_id();

    let setup_message = message.clone();
    let setup_done = done.clone();
    let slot = recorder.slot();
    let report = harness.run_test(
        "queued-emit-before-run",
        move |ctx| {
            let receiver = ctx.receiver()?;
            setup_message.connect_receiver(&receiver, slot, ConnectionType::Queued)?;
            let ctx = *ctx;
            setup_done.connect_receiver(&receiver, move |_| ctx.quit(), ConnectionType::Queued)?;

            setup_message.emit("hello".to_string())?;
            setup_done.emit(())?;
            Ok(())
        },
        move |_| {
            assert_eq!(recorder.args(), vec!["hello".to_string()]);
            assert!(recorder.all_on_thread(loop_thread));
        },
    )?;

    if message.connection_count() + done.connection_count() != 0 {
        return Err(HarnessError::Unexpected(
            "connections outlived the test root".to_string(),
        ));
    }
    Ok(vec![report])
}

/// Two tests back to back on the shared loop, each passing after
/// `success_after` under the configured guard.
pub fn sequential_tests(harness: &TestHarness, success_after: Duration) -> Result<Vec<TestReport>> {
    let mut reports = Vec::with_capacity(2);
    for name in ["sequential-1", "sequential-2"] {
        let successes = CallRecorder::<()>::new();
        let slot = successes.slot();
        let report = harness.run_test(
            name,
            move |ctx| {
                let ctx = *ctx;
                ctx.event_loop().single_shot_owned(ctx.root(), success_after, move || {
                    slot(&());
                    ctx.quit();
                })?;
                Ok(())
            },
            move |_| assert_eq!(successes.call_count(), 1),
        )?;
        reports.push(report);
    }
    Ok(reports)
}

/// A worker emits `count` results over a queued connection, then its
/// `finished` signal quits the loop.
pub fn worker_results(harness: &TestHarness, count: usize) -> Result<Vec<TestReport>> {
    let recorder = CallRecorder::<usize>::new();
    let loop_thread = harness.event_loop().thread_id();

    let slot = recorder.slot();
    let report = harness.run_test(
        "worker-results",
        move |ctx| {
            let worker = Worker::<usize>::with_config(WorkerConfig::with_name("scenario-worker"))?;
            let receiver = ctx.receiver()?;
            worker
                .on_result()
                .connect_receiver(&receiver, slot, ConnectionType::Queued)?;
            let quit_ctx = *ctx;
            worker
                .on_finished()
                .connect_receiver(&receiver, move |_| quit_ctx.quit(), ConnectionType::Queued)?;

            for i in 0..count {
                if !worker.send(move || i) {
                    return Err(HarnessError::setup(format!("worker rejected task {i}")));
                }
            }
            worker.stop();
            // The worker lives as long as the test root.
            ctx.event_loop().add_cleanup(ctx.root(), move |_| {
                worker.stop_and_join();
            })?;
            Ok(())
        },
        move |_| {
            assert_eq!(recorder.args(), (0..count).collect::<Vec<_>>());
            assert!(recorder.all_on_thread(loop_thread));
        },
    )?;
    Ok(vec![report])
}

/// A test that never signals success must end with [`HarnessError::TimedOut`].
pub fn guard_timeout(harness: &TestHarness) -> Result<Vec<TestReport>> {
    let started = Instant::now();
    match harness.run_test("guard-timeout", |_| Ok(()), |_| {}) {
        Err(HarnessError::TimedOut { .. }) => Ok(vec![TestReport {
            name: "guard-timeout".to_string(),
            exit_code: harness.config().failure_exit_code,
            elapsed: started.elapsed(),
        }]),
        Ok(report) => Err(HarnessError::Unexpected(format!(
            "test passed with exit code {} instead of timing out",
            report.exit_code
        ))),
        Err(other) => Err(other),
    }
}
