//! Invocation records for deferred delivery.
//!
//! Every piece of deferred work in signalbox, whether a queued slot call, a
//! timer fire or a posted task, travels through an event loop's queue as an
//! [`InvocationRecord`]. A record wraps a closure that has already captured
//! its arguments, so it is immutable once queued and can only be consumed
//! once by [`InvocationRecord::execute`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::Instant;

use crate::error::CallbackFailure;
use crate::object::NodeId;
use crate::timer::TimerId;

/// Global sequence counter for records, in enqueue-construction order.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Conversion of a callback's return value into a delivery outcome.
///
/// Implemented for `()` (always succeeds) and for `Result<(), E>` where the
/// error is displayable, so slots can be written either way:
///
/// ```
/// use signalbox_core::Signal;
///
/// let signal = Signal::<i32>::new();
/// signal.connect_direct(|_| {});
/// signal.connect_direct(|&n| if n < 0 { Err("negative") } else { Ok(()) });
/// ```
pub trait IntoSlotResult {
    /// Convert into `Ok(())` or an error message.
    fn into_slot_result(self) -> Result<(), String>;
}

impl IntoSlotResult for () {
    fn into_slot_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: fmt::Display> IntoSlotResult for Result<(), E> {
    fn into_slot_result(self) -> Result<(), String> {
        self.map_err(|e| e.to_string())
    }
}

/// Where a queued invocation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOrigin {
    /// A queued connection of the named signal.
    Signal(Arc<str>),
    /// A timer fire.
    Timer(TimerId),
    /// A task posted directly to the loop.
    Posted,
}

impl fmt::Display for InvocationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal `{name}`"),
            Self::Timer(id) => write!(f, "timer {id:?}"),
            Self::Posted => write!(f, "posted task"),
        }
    }
}

type BoxedInvocation = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// A deferred call waiting in an event loop's queue.
pub struct InvocationRecord {
    sequence: u64,
    origin: InvocationOrigin,
    owner: Option<NodeId>,
    target_thread: ThreadId,
    enqueued_at: Instant,
    invoke: BoxedInvocation,
}

impl InvocationRecord {
    /// Create a record that will run `invoke` on `target_thread`.
    pub fn new<F, R>(origin: InvocationOrigin, target_thread: ThreadId, invoke: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoSlotResult,
    {
        Self {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            origin,
            owner: None,
            target_thread,
            enqueued_at: Instant::now(),
            invoke: Box::new(move || invoke().into_slot_result()),
        }
    }

    /// Attach the node whose destruction cancels this record.
    pub fn with_owner(mut self, owner: Option<NodeId>) -> Self {
        self.owner = owner;
        self
    }

    /// Monotonic sequence number assigned at construction.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Where this record came from.
    pub fn origin(&self) -> &InvocationOrigin {
        &self.origin
    }

    /// The node this record is delivered on behalf of, if any.
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    /// The thread this record must execute on.
    pub fn target_thread(&self) -> ThreadId {
        self.target_thread
    }

    /// When the record was created.
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Execute the invocation, consuming the record.
    ///
    /// Errors returned by the callback and panics raised inside it are both
    /// reported as a [`CallbackFailure`]; neither escapes this call.
    pub fn execute(self) -> Result<(), CallbackFailure> {
        let Self { origin, invoke, .. } = self;
        match panic::catch_unwind(AssertUnwindSafe(invoke)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(CallbackFailure::new(origin.to_string(), message)),
            Err(payload) => Err(CallbackFailure::new(
                origin.to_string(),
                format!("panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }
}

impl fmt::Debug for InvocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationRecord")
            .field("sequence", &self.sequence)
            .field("origin", &self.origin)
            .field("owner", &self.owner)
            .field("target_thread", &self.target_thread)
            .finish_non_exhaustive()
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn here() -> ThreadId {
        std::thread::current().id()
    }

    #[test]
    fn test_execute_runs_closure_once() {
        let executed = Arc::new(AtomicBool::new(false));
        let executed_clone = executed.clone();
        let record = InvocationRecord::new(InvocationOrigin::Posted, here(), move || {
            executed_clone.store(true, Ordering::SeqCst);
        });

        assert!(record.execute().is_ok());
        assert!(executed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let first = InvocationRecord::new(InvocationOrigin::Posted, here(), || {});
        let second = InvocationRecord::new(InvocationOrigin::Posted, here(), || {});
        assert!(second.sequence() > first.sequence());
    }

    #[test]
    fn test_error_result_becomes_failure() {
        let record = InvocationRecord::new(
            InvocationOrigin::Signal(Arc::from("result_ready")),
            here(),
            || Err::<(), _>("disk full"),
        );

        let failure = record.execute().unwrap_err();
        assert_eq!(failure.origin, "signal `result_ready`");
        assert_eq!(failure.message, "disk full");
    }

    #[test]
    fn test_panic_is_caught() {
        let record = InvocationRecord::new(InvocationOrigin::Posted, here(), || -> () {
            panic!("slot exploded");
        });

        let failure = record.execute().unwrap_err();
        assert_eq!(failure.origin, "posted task");
        assert!(failure.message.contains("slot exploded"));
    }
}
