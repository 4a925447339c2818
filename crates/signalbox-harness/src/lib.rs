//! Deterministic test harness for signalbox event loops.
//!
//! A [`TestHarness`] runs each test on the calling thread's shared
//! [`EventLoop`](signalbox_core::EventLoop):
//!
//! - a fresh root node owns everything the test creates;
//! - a [`TimeoutGuard`] stops the loop with the failure code if the test
//!   never signals success;
//! - the root is destroyed after the test, so nothing leaks into the next one.
//!
//! [`CallRecorder`] records what slots received and on which thread.
//!
//! # Example
//!
//! ```
//! use signalbox_core::{ConnectionType, Signal};
//! use signalbox_harness::{CallRecorder, HarnessConfig, TestHarness};
//!
//! let harness = TestHarness::new(HarnessConfig::default());
//! let recorder = CallRecorder::<i32>::new();
//! let signal = Signal::<i32>::named("value");
//!
//! let slot = recorder.slot();
//! let sender = signal.clone();
//! let checked = recorder.clone();
//! harness
//!     .run_test(
//!         "value-arrives",
//!         move |ctx| {
//!             sender.connect_receiver(&ctx.receiver()?, slot, ConnectionType::Queued)?;
//!             sender.emit(7)?;
//!             ctx.single_shot(10, { let ctx = *ctx; move || ctx.quit() })?;
//!             Ok(())
//!         },
//!         move |_| assert_eq!(checked.args(), vec![7]),
//!     )
//!     .unwrap();
//! ```

pub mod config;
mod error;
pub mod guard;
pub mod harness;
pub mod recorder;
pub mod scenarios;

pub use config::HarnessConfig;
pub use error::{ConfigError, HarnessError, Result};
pub use guard::TimeoutGuard;
pub use harness::{TestContext, TestHarness, TestReport};
pub use recorder::{CallRecorder, RecordedCall};
pub use scenarios::{Scenario, ScenarioResult};
