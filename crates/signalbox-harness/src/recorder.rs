//! Call-recording slots.
//!
//! A [`CallRecorder`] stands in for a real slot: connect its
//! [`slot`](CallRecorder::slot) to a signal, run the loop, then inspect what
//! arrived and on which thread.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall<Args> {
    /// The arguments the slot received.
    pub args: Args,
    /// The thread the slot ran on.
    pub thread: ThreadId,
    /// When the slot ran.
    pub at: Instant,
}

/// Records every call made through its slots.
///
/// Cloning yields another handle to the same record.
///
/// # Example
///
/// ```
/// use signalbox_core::Signal;
/// use signalbox_harness::CallRecorder;
///
/// let recorder = CallRecorder::<i32>::new();
/// let signal = Signal::<i32>::new();
/// signal.connect_direct(recorder.slot());
///
/// signal.emit(1).unwrap();
/// signal.emit(2).unwrap();
/// assert_eq!(recorder.args(), vec![1, 2]);
/// ```
pub struct CallRecorder<Args> {
    calls: Arc<Mutex<Vec<RecordedCall<Args>>>>,
}

impl<Args> Clone for CallRecorder<Args> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
        }
    }
}

impl<Args: Clone + Send + 'static> Default for CallRecorder<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Clone + Send + 'static> CallRecorder<Args> {
    /// An empty recorder.
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A slot that records its arguments and the calling thread.
    pub fn slot(&self) -> impl Fn(&Args) + Send + Sync + 'static {
        let calls = self.calls.clone();
        move |args: &Args| {
            calls.lock().push(RecordedCall {
                args: args.clone(),
                thread: thread::current().id(),
                at: Instant::now(),
            });
        }
    }

    /// Number of calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Whether any call was recorded.
    pub fn was_called(&self) -> bool {
        self.call_count() > 0
    }

    /// Every recorded call, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall<Args>> {
        self.calls.lock().clone()
    }

    /// The arguments of every call, oldest first.
    pub fn args(&self) -> Vec<Args> {
        self.calls.lock().iter().map(|call| call.args.clone()).collect()
    }

    /// The most recent call.
    pub fn last(&self) -> Option<RecordedCall<Args>> {
        self.calls.lock().last().cloned()
    }

    /// Whether every call ran on `thread`.
    pub fn all_on_thread(&self, thread: ThreadId) -> bool {
        self.calls.lock().iter().all(|call| call.thread == thread)
    }

    /// Forget all recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl<Args> fmt::Debug for CallRecorder<Args> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecorder")
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_args_in_order() {
        let recorder = CallRecorder::<String>::new();
        let slot = recorder.slot();
        slot(&"a".to_string());
        slot(&"b".to_string());

        assert_eq!(recorder.call_count(), 2);
        assert_eq!(recorder.args(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(recorder.last().unwrap().args, "b");
        assert!(recorder.all_on_thread(thread::current().id()));
    }

    #[test]
    fn test_clones_share_calls() {
        let recorder = CallRecorder::<u32>::new();
        let other = recorder.clone();
        (other.slot())(&7);
        assert_eq!(recorder.args(), vec![7]);

        recorder.clear();
        assert!(!other.was_called());
        assert!(other.last().is_none());
    }

    #[test]
    fn test_records_calling_thread() {
        let recorder = CallRecorder::<()>::new();
        let slot = recorder.slot();
        let worker = thread::spawn(move || {
            slot(&());
            thread::current().id()
        })
        .join()
        .unwrap();

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].thread, worker);
        assert!(!recorder.all_on_thread(thread::current().id()));
    }
}
