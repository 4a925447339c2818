//! Signal/slot system for signalbox.
//!
//! A [`Signal<Args>`] keeps an ordered list of connected slots. Each
//! connection picks its delivery discipline when it is made:
//!
//! - **Direct**: the slot runs synchronously on the emitting thread, before
//!   `emit` returns. A failing slot aborts the emission and its error is
//!   returned from `emit`.
//! - **Queued**: `emit` pushes an [`InvocationRecord`] onto the target event
//!   loop's queue and returns immediately. The slot runs on the loop's thread
//!   the next time that loop drains its queue.
//!
//! Emission iterates over a snapshot of the connections taken when `emit`
//! starts, so slots may connect or disconnect freely while it runs.
//!
//! # Example
//!
//! ```
//! use signalbox_core::{EventLoop, Signal};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicI32, Ordering};
//!
//! let value_changed = Signal::<i32>::named("value_changed");
//! let total = Arc::new(AtomicI32::new(0));
//!
//! let direct = total.clone();
//! value_changed.connect_direct(move |&n| {
//!     direct.fetch_add(n, Ordering::SeqCst);
//! });
//! let queued = total.clone();
//! value_changed.connect_queued(move |&n| {
//!     queued.fetch_add(n * 100, Ordering::SeqCst);
//! });
//!
//! value_changed.emit(1).unwrap();
//! assert_eq!(total.load(Ordering::SeqCst), 1);
//!
//! EventLoop::current().process_events().unwrap();
//! assert_eq!(total.load(Ordering::SeqCst), 101);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::error::{CallbackFailure, Result};
use crate::event_loop::{EventLoop, Receiver};
use crate::invocation::{IntoSlotResult, InvocationOrigin, InvocationRecord};
use crate::object::NodeId;

new_key_type! {
    /// A unique identifier for a signal-slot connection.
    ///
    /// Use this ID to disconnect a specific connection via [`Signal::disconnect`].
    /// The ID remains valid until the connection is disconnected, either
    /// explicitly or by the destruction of its receiver node.
    pub struct ConnectionId;
}

/// Specifies how a connected slot is invoked when the signal is emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionType {
    /// Invoke the slot immediately on the emitting thread.
    ///
    /// There is no re-entrancy protection: a direct slot that emits the same
    /// signal recurses.
    Direct,

    /// Queue the slot invocation to the receiver's event loop.
    ///
    /// The slot runs on the loop's thread regardless of which thread emits.
    Queued,
}

type SlotFn<Args> = Arc<dyn Fn(&Args) -> std::result::Result<(), String> + Send + Sync>;

/// Where a connection delivers.
#[derive(Clone, Copy)]
enum Delivery {
    Direct,
    Queued(&'static EventLoop),
}

/// Internal storage for a single connection.
struct Connection<Args> {
    slot: SlotFn<Args>,
    delivery: Delivery,
    /// Receiver node; queued records carry it so its destruction drops them.
    owner: Option<NodeId>,
}

impl<Args> Connection<Args> {
    fn connection_type(&self) -> ConnectionType {
        match self.delivery {
            Delivery::Direct => ConnectionType::Direct,
            Delivery::Queued(_) => ConnectionType::Queued,
        }
    }
}

/// Connections in registration order.
struct ConnectionTable<Args> {
    slots: SlotMap<ConnectionId, Arc<Connection<Args>>>,
    order: Vec<ConnectionId>,
}

impl<Args> ConnectionTable<Args> {
    fn remove(&mut self, id: ConnectionId) -> bool {
        if self.slots.remove(id).is_some() {
            self.order.retain(|&other| other != id);
            true
        } else {
            false
        }
    }
}

struct SignalInner<Args> {
    connections: Mutex<ConnectionTable<Args>>,
    /// Whether signal emission is temporarily blocked.
    blocked: AtomicBool,
}

impl<Args> SignalInner<Args> {
    fn disconnect(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(id)
    }
}

/// A type-safe signal that can have multiple connected slots.
///
/// # Type Parameter
///
/// - `Args`: The argument type passed to connected slots. Use `()` for signals
///   with no arguments, or a tuple like `(String, i32)` for multiple arguments.
///   Queued connections clone the arguments once per connection.
///
/// # Sharing
///
/// Cloning a `Signal` yields another handle to the same connection list, so
/// a signal can be handed to a worker thread while the main thread keeps
/// connecting to it.
pub struct Signal<Args> {
    name: Arc<str>,
    inner: Arc<SignalInner<Args>>,
}

impl<Args> Clone for Signal<Args> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<Args: Clone + Send + 'static> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Clone + Send + 'static> Signal<Args> {
    /// Create a new anonymous signal with no connections.
    pub fn new() -> Self {
        Self::named("<unnamed>")
    }

    /// Create a signal with a name used in logs and failure reports.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(SignalInner {
                connections: Mutex::new(ConnectionTable {
                    slots: SlotMap::with_key(),
                    order: Vec::new(),
                }),
                blocked: AtomicBool::new(false),
            }),
        }
    }

    /// The signal's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect a slot that runs synchronously on the emitting thread.
    pub fn connect_direct<F, R>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
        R: IntoSlotResult,
    {
        self.insert(wrap_slot(slot), Delivery::Direct, None)
    }

    /// Connect a slot that runs on the connecting thread's event loop.
    ///
    /// The loop is created if this thread has none yet.
    pub fn connect_queued<F, R>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
        R: IntoSlotResult,
    {
        self.insert(wrap_slot(slot), Delivery::Queued(EventLoop::current()), None)
    }

    /// Connect a slot with a specific connection type.
    ///
    /// # Example
    ///
    /// ```
    /// use signalbox_core::{ConnectionType, Signal};
    ///
    /// let signal = Signal::<i32>::new();
    /// signal.connect_with_type(|n| println!("now {n}"), ConnectionType::Direct);
    /// signal.connect_with_type(|n| println!("later {n}"), ConnectionType::Queued);
    /// signal.emit(42).unwrap();
    /// ```
    pub fn connect_with_type<F, R>(&self, slot: F, connection_type: ConnectionType) -> ConnectionId
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
        R: IntoSlotResult,
    {
        match connection_type {
            ConnectionType::Direct => self.connect_direct(slot),
            ConnectionType::Queued => self.connect_queued(slot),
        }
    }

    /// Connect a slot on behalf of a receiver node.
    ///
    /// Queued deliveries go to the receiver's event loop and are dropped if
    /// the node is destroyed before they run. The connection itself is
    /// removed when the node is destroyed. Must be called on the receiver
    /// loop's thread.
    pub fn connect_receiver<F, R>(
        &self,
        receiver: &Receiver,
        slot: F,
        connection_type: ConnectionType,
    ) -> Result<ConnectionId>
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
        R: IntoSlotResult,
    {
        let event_loop = receiver.event_loop();
        let node = receiver.node();
        let delivery = match connection_type {
            ConnectionType::Direct => Delivery::Direct,
            ConnectionType::Queued => Delivery::Queued(event_loop),
        };
        let id = self.insert(wrap_slot(slot), delivery, Some(node));

        let weak: Weak<SignalInner<Args>> = Arc::downgrade(&self.inner);
        let registered = event_loop.add_cleanup(node, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.disconnect(id);
            }
        });
        if let Err(e) = registered {
            self.disconnect(id);
            return Err(e);
        }
        Ok(id)
    }

    fn insert(&self, slot: SlotFn<Args>, delivery: Delivery, owner: Option<NodeId>) -> ConnectionId {
        let connection = Arc::new(Connection {
            slot,
            delivery,
            owner,
        });
        let connection_type = connection.connection_type();
        let mut table = self.inner.connections.lock();
        let id = table.slots.insert(connection);
        table.order.push(id);
        tracing::trace!(
            target: "signalbox_core::signal",
            signal = %self.name,
            ?id,
            ?connection_type,
            "connected"
        );
        id
    }

    /// Disconnect a specific slot by its connection ID.
    ///
    /// Returns `true` if the connection was found and removed, `false` otherwise.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.inner.disconnect(id)
    }

    /// Disconnect all slots from this signal.
    pub fn disconnect_all(&self) {
        let mut table = self.inner.connections.lock();
        table.slots.clear();
        table.order.clear();
    }

    /// Get the number of connected slots.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().slots.len()
    }

    /// The discipline of a connection, if it is still connected.
    pub fn connection_type(&self, id: ConnectionId) -> Option<ConnectionType> {
        self.inner
            .connections
            .lock()
            .slots
            .get(id)
            .map(|c| c.connection_type())
    }

    /// Block signal emission temporarily.
    ///
    /// While blocked, calls to `emit()` do nothing.
    pub fn set_blocked(&self, blocked: bool) {
        self.inner.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Check if signal emission is currently blocked.
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    /// Emit the signal, invoking all connected slots in registration order.
    ///
    /// Direct slots run before this returns; the first one to fail stops the
    /// emission and its failure is returned. Queued slots are only enqueued,
    /// so `emit` never waits on an event loop.
    #[tracing::instrument(skip_all, target = "signalbox_core::signal", level = "trace", fields(signal = %self.name))]
    pub fn emit(&self, args: Args) -> Result<()> {
        if self.is_blocked() {
            tracing::trace!(target: "signalbox_core::signal", "signal blocked, skipping emit");
            return Ok(());
        }

        let snapshot: Vec<Arc<Connection<Args>>> = {
            let table = self.inner.connections.lock();
            table
                .order
                .iter()
                .filter_map(|id| table.slots.get(*id).cloned())
                .collect()
        };
        tracing::trace!(target: "signalbox_core::signal", connection_count = snapshot.len(), "emitting signal");

        for connection in snapshot {
            match connection.delivery {
                Delivery::Direct => {
                    (connection.slot)(&args).map_err(|message| {
                        CallbackFailure::new(self.origin().to_string(), message)
                    })?;
                }
                Delivery::Queued(event_loop) => {
                    let slot = connection.slot.clone();
                    let args = args.clone();
                    let record =
                        InvocationRecord::new(self.origin(), event_loop.thread_id(), move || slot(&args))
                            .with_owner(connection.owner);
                    event_loop.enqueue(record);
                }
            }
        }
        Ok(())
    }

    fn origin(&self) -> InvocationOrigin {
        InvocationOrigin::Signal(self.name.clone())
    }

    /// Connect a slot with automatic disconnection when the guard is dropped.
    pub fn connect_scoped<F, R>(&self, slot: F, connection_type: ConnectionType) -> ConnectionGuard<Args>
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
        R: IntoSlotResult,
    {
        let id = self.connect_with_type(slot, connection_type);
        ConnectionGuard {
            signal: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl<Args> fmt::Debug for Signal<Args> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("connections", &self.inner.connections.lock().slots.len())
            .field("blocked", &self.inner.blocked.load(Ordering::Relaxed))
            .finish()
    }
}

fn wrap_slot<Args, F, R>(slot: F) -> SlotFn<Args>
where
    F: Fn(&Args) -> R + Send + Sync + 'static,
    R: IntoSlotResult,
{
    Arc::new(move |args: &Args| slot(args).into_slot_result())
}

/// A connection guard that disconnects when dropped.
///
/// Created via [`Signal::connect_scoped`]. The guard does not keep the signal
/// alive; dropping it after the signal is gone does nothing.
///
/// # Example
///
/// ```
/// use signalbox_core::{ConnectionType, Signal};
/// use std::sync::atomic::{AtomicI32, Ordering};
/// use std::sync::Arc;
///
/// let signal = Signal::<i32>::new();
/// let counter = Arc::new(AtomicI32::new(0));
/// {
///     let counter_clone = counter.clone();
///     let _guard = signal.connect_scoped(
///         move |&n| {
///             counter_clone.fetch_add(n, Ordering::SeqCst);
///         },
///         ConnectionType::Direct,
///     );
///     signal.emit(42).unwrap();
/// }
/// signal.emit(43).unwrap();
/// assert_eq!(counter.load(Ordering::SeqCst), 42);
/// ```
pub struct ConnectionGuard<Args> {
    signal: Weak<SignalInner<Args>>,
    id: ConnectionId,
}

impl<Args> ConnectionGuard<Args> {
    /// The guarded connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl<Args> Drop for ConnectionGuard<Args> {
    fn drop(&mut self) {
        if let Some(inner) = self.signal.upgrade() {
            inner.disconnect(self.id);
        }
    }
}

static_assertions::assert_impl_all!(Signal<String>: Send, Sync, Clone);
static_assertions::assert_impl_all!(ConnectionGuard<String>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_connect_emit() {
        let signal = Signal::<i32>::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        signal.connect_direct(move |&value| {
            received_clone.lock().push(value);
        });

        signal.emit(42).unwrap();
        signal.emit(100).unwrap();

        assert_eq!(*received.lock(), vec![42, 100]);
    }

    #[test]
    fn test_direct_slots_run_in_registration_order() {
        let signal = Signal::<()>::named("ordered");
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..5 {
            let order = order.clone();
            signal.connect_direct(move |_| {
                order.lock().push(tag);
            });
        }

        signal.emit(()).unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_order_survives_slot_reuse() {
        let signal = Signal::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let push = |tag: &'static str| {
            let order = order.clone();
            move |_: &()| order.lock().push(tag)
        };
        let first = signal.connect_direct(push("a"));
        signal.connect_direct(push("b"));
        signal.disconnect(first);
        signal.connect_direct(push("c"));

        signal.emit(()).unwrap();
        assert_eq!(*order.lock(), vec!["b", "c"]);
    }

    #[test]
    fn test_signal_disconnect() {
        let signal = Signal::<i32>::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        let conn_id = signal.connect_direct(move |&value| {
            received_clone.lock().push(value);
        });

        signal.emit(1).unwrap();
        assert!(signal.disconnect(conn_id));
        assert!(!signal.disconnect(conn_id));
        signal.emit(2).unwrap();

        assert_eq!(*received.lock(), vec![1]);
    }

    #[test]
    fn test_signal_blocked() {
        let signal = Signal::<i32>::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        signal.connect_direct(move |&value| {
            received_clone.lock().push(value);
        });

        signal.emit(1).unwrap();
        signal.set_blocked(true);
        signal.emit(2).unwrap();
        signal.set_blocked(false);
        signal.emit(3).unwrap();

        assert_eq!(*received.lock(), vec![1, 3]);
    }

    #[test]
    fn test_disconnect_all() {
        let signal = Signal::<()>::new();

        for _ in 0..5 {
            signal.connect_direct(|_| {});
        }

        assert_eq!(signal.connection_count(), 5);
        signal.disconnect_all();
        assert_eq!(signal.connection_count(), 0);
        signal.emit(()).unwrap();
    }

    #[test]
    fn test_direct_failure_stops_emission() {
        let signal = Signal::<i32>::named("checked");
        let later = Arc::new(AtomicBool::new(false));

        signal.connect_direct(|&n| if n < 0 { Err("negative input") } else { Ok(()) });
        let later_clone = later.clone();
        signal.connect_direct(move |_| {
            later_clone.store(true, Ordering::SeqCst);
        });

        let err = signal.emit(-1).unwrap_err();
        assert_eq!(err.to_string(), "callback failed: signal `checked`: negative input");
        assert!(!later.load(Ordering::SeqCst));

        signal.emit(1).unwrap();
        assert!(later.load(Ordering::SeqCst));
    }

    #[test]
    fn test_emission_uses_snapshot() {
        let signal = Signal::<()>::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        // The first slot connects a new slot and disconnects the second one;
        // neither change affects the emission in progress.
        let handle = signal.clone();
        let calls_clone = calls.clone();
        let second = Arc::new(Mutex::new(None));
        let second_clone = second.clone();
        signal.connect_direct(move |_| {
            calls_clone.lock().push("first");
            let calls_inner = calls_clone.clone();
            handle.connect_direct(move |_| calls_inner.lock().push("added"));
            if let Some(id) = second_clone.lock().take() {
                handle.disconnect(id);
            }
        });
        let calls_clone = calls.clone();
        *second.lock() = Some(signal.connect_direct(move |_| calls_clone.lock().push("second")));

        signal.emit(()).unwrap();
        assert_eq!(*calls.lock(), vec!["first", "second"]);

        calls.lock().clear();
        signal.emit(()).unwrap();
        assert_eq!(*calls.lock(), vec!["first", "added"]);
    }

    #[test]
    fn test_connection_guard() {
        let signal = Signal::<i32>::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        {
            let received_clone = received.clone();
            let guard = signal.connect_scoped(
                move |&value| {
                    received_clone.lock().push(value);
                },
                ConnectionType::Direct,
            );
            assert_eq!(signal.connection_type(guard.id()), Some(ConnectionType::Direct));
            signal.emit(1).unwrap();
        }

        signal.emit(2).unwrap();
        assert_eq!(*received.lock(), vec![1]);
    }

    #[test]
    fn test_guard_outliving_signal() {
        let signal = Signal::<()>::new();
        let guard = signal.connect_scoped(|_| {}, ConnectionType::Direct);
        drop(signal);
        drop(guard);
    }

    #[test]
    fn test_signal_with_multiple_args() {
        let signal = Signal::<(String, i32)>::new();
        let received = Arc::new(Mutex::new(None));

        let received_clone = received.clone();
        signal.connect_direct(move |args| {
            *received_clone.lock() = Some(args.clone());
        });

        signal.emit(("hello".to_string(), 42)).unwrap();
        assert_eq!(received.lock().clone(), Some(("hello".to_string(), 42)));
    }

    #[test]
    fn test_cross_thread_direct_emit() {
        let signal = Signal::<i32>::new();
        let slot_thread = Arc::new(Mutex::new(None));

        let slot_thread_clone = slot_thread.clone();
        signal.connect_direct(move |_| {
            *slot_thread_clone.lock() = Some(std::thread::current().id());
        });

        let signal_clone = signal.clone();
        let emitting_thread_id = std::thread::spawn(move || {
            signal_clone.emit(100).unwrap();
            std::thread::current().id()
        })
        .join()
        .unwrap();

        assert_eq!(*slot_thread.lock(), Some(emitting_thread_id));
    }

    #[test]
    fn test_queued_waits_for_loop() {
        let event_loop = EventLoop::current();
        let signal = Signal::<i32>::named("queued");
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        let id = signal.connect_queued(move |&value| {
            received_clone.lock().push((value, std::thread::current().id()));
        });
        assert_eq!(signal.connection_type(id), Some(ConnectionType::Queued));

        let signal_clone = signal.clone();
        std::thread::spawn(move || signal_clone.emit(7).unwrap())
            .join()
            .unwrap();

        assert!(received.lock().is_empty());
        assert_eq!(event_loop.pending_count(), 1);

        event_loop.process_events().unwrap();
        assert_eq!(*received.lock(), vec![(7, std::thread::current().id())]);
    }

    #[test]
    fn test_emit_from_multiple_threads() {
        let signal = Signal::<usize>::new();
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter_clone = counter.clone();
        signal.connect_direct(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let signal = signal.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        signal.emit(i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }
}
