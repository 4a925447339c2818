//! Thread affinity verification for signalbox.
//!
//! Every [`EventLoop`](crate::EventLoop) belongs to the thread that created
//! it. Driving the loop (`run`, `process_events`) and mutating its ownership
//! tree must happen on that thread; only pushing work (`post`, queued emits,
//! `exit`, `stop_timer`) is allowed from anywhere.
//!
//! Two levels of checking are provided:
//!
//! - **Fallible checks** ([`ThreadAffinity::check`]): always active, return
//!   [`Error::WrongThread`]. Used where a caller can reasonably recover.
//! - **Debug assertions** ([`ThreadAffinity::debug_assert_same_thread`]): only
//!   active in debug builds while checks are enabled. Used on hot paths where
//!   a foreign-thread call is a programming error.
//!
//! ```
//! use signalbox_core::thread_check::ThreadAffinity;
//!
//! let affinity = ThreadAffinity::current();
//! assert!(affinity.check().is_ok());
//!
//! let remote = std::thread::spawn(move || affinity.check().is_err())
//!     .join()
//!     .unwrap();
//! assert!(remote);
//! ```

use std::thread::ThreadId;

use crate::error::{Error, Result};

/// Whether debug thread assertions are active.
///
/// They run in debug builds only. [`ThreadAffinity::check`] is not affected.
#[inline]
pub const fn are_thread_checks_enabled() -> bool {
    cfg!(debug_assertions)
}

/// Records the thread an event loop belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAffinity {
    thread_id: ThreadId,
}

impl Default for ThreadAffinity {
    fn default() -> Self {
        Self::current()
    }
}

impl ThreadAffinity {
    /// Create an affinity bound to the current thread.
    #[inline]
    pub fn current() -> Self {
        Self {
            thread_id: std::thread::current().id(),
        }
    }

    /// Get the thread ID this affinity is bound to.
    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Check if the current thread matches this affinity.
    #[inline]
    pub fn is_same_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Return [`Error::WrongThread`] unless called from the bound thread.
    pub fn check(&self) -> Result<()> {
        let current = std::thread::current().id();
        if current == self.thread_id {
            Ok(())
        } else {
            Err(Error::WrongThread {
                owner: self.thread_id,
                current,
            })
        }
    }

    /// Assert that we are on the bound thread.
    ///
    /// # Panics
    ///
    /// Panics with a descriptive message if called from a different thread.
    pub fn assert_same_thread_with_msg(&self, msg: &str) {
        if !self.is_same_thread() {
            self.panic_wrong_thread(msg);
        }
    }

    /// Debug-only assertion that we are on the bound thread.
    ///
    /// This is a no-op in release builds or while checks are disabled.
    #[inline]
    pub fn debug_assert_same_thread(&self, msg: &str) {
        #[cfg(debug_assertions)]
        if are_thread_checks_enabled() {
            self.assert_same_thread_with_msg(msg);
        }
        #[cfg(not(debug_assertions))]
        let _ = msg;
    }

    #[cold]
    #[inline(never)]
    fn panic_wrong_thread(&self, msg: &str) -> ! {
        let current = std::thread::current();
        let current_name = current.name().unwrap_or("<unnamed>");
        let current_id = current.id();

        panic!(
            "thread affinity violation: {msg}\n\
             event loop thread: {:?}\n\
             current thread: \"{current_name}\" ({current_id:?})\n\
             post the operation with EventLoop::post or connect with ConnectionType::Queued",
            self.thread_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_affinity_same_thread() {
        let affinity = ThreadAffinity::current();
        assert!(affinity.is_same_thread());
        assert!(affinity.check().is_ok());
        affinity.assert_same_thread_with_msg("same thread");
        affinity.debug_assert_same_thread("same thread");
    }

    #[test]
    fn test_thread_affinity_check_from_other_thread() {
        let affinity = ThreadAffinity::current();
        let owner = std::thread::current().id();

        let err = std::thread::spawn(move || affinity.check())
            .join()
            .unwrap()
            .unwrap_err();

        match err {
            Error::WrongThread { owner: o, current } => {
                assert_eq!(o, owner);
                assert_ne!(current, owner);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_thread_affinity_panic_on_wrong_thread() {
        let affinity = ThreadAffinity::current();

        let result = std::thread::spawn(move || {
            affinity.assert_same_thread_with_msg("tree mutated off-thread");
        })
        .join();

        assert!(result.is_err(), "Expected thread to panic with affinity violation");
    }

    #[test]
    fn test_thread_affinity_default() {
        let affinity = ThreadAffinity::default();
        assert!(affinity.is_same_thread());
        assert_eq!(affinity.thread_id(), std::thread::current().id());
    }
}
