//! Core systems for signalbox.
//!
//! This crate provides the moving parts of a deterministic, event-driven
//! signal/slot runtime:
//!
//! - **Event Loop**: a leaked, per-thread reactor with run/exit semantics
//! - **Signal/Slot System**: typed signals with Direct and Queued delivery
//! - **Timers**: one-shot and repeating timers delivered through the loop queue
//! - **Ownership Tree**: parent-child lifecycle with deferred deletion
//! - **Worker**: a dedicated background thread that reports through signals
//!
//! # Signal/Slot Example
//!
//! ```
//! use signalbox_core::Signal;
//!
//! let value_changed = Signal::<i32>::named("value_changed");
//!
//! let conn_id = value_changed.connect_direct(|value| {
//!     println!("Value changed to: {value}");
//! });
//! value_changed.emit(42).unwrap();
//! value_changed.disconnect(conn_id);
//! ```
//!
//! # Event Loop Example
//!
//! ```
//! use signalbox_core::{EventLoop, Signal};
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::current();
//! let root = event_loop.create_node("root");
//!
//! // A queued connection owned by `root`.
//! let ready = Signal::<String>::named("ready");
//! let receiver = event_loop.receiver(root).unwrap();
//! ready
//!     .connect_receiver(&receiver, |msg| println!("got {msg}"), signalbox_core::ConnectionType::Queued)
//!     .unwrap();
//!
//! ready.emit("hello".to_string()).unwrap();
//! event_loop
//!     .single_shot_owned(root, Duration::from_millis(10), move || event_loop.quit())
//!     .unwrap();
//!
//! assert_eq!(event_loop.run().unwrap(), 0);
//!
//! // Tear down everything the test created.
//! event_loop.delete_later(root).unwrap();
//! event_loop.process_deferred_deletions().unwrap();
//! assert_eq!(ready.connection_count(), 0);
//! ```

mod error;
mod event_loop;
pub mod invocation;
pub mod logging;
pub mod object;
pub mod queue;
pub mod signal;
pub mod thread_check;
pub mod timer;
pub mod worker;

pub use error::{CallbackFailure, Error, Result};
pub use event_loop::{EventLoop, LoopState, Receiver};
pub use invocation::{IntoSlotResult, InvocationOrigin, InvocationRecord};
pub use logging::PerfSpan;
pub use object::{CleanupHook, NodeId, ObjectTree};
pub use queue::ThreadSafeQueue;
pub use signal::{ConnectionGuard, ConnectionId, ConnectionType, Signal};
pub use timer::{TimerId, TimerKind};
pub use worker::{StopFlag, Worker, WorkerBuilder, WorkerConfig};
