//! The per-thread event loop (reactor).
//!
//! Each thread lazily gets one [`EventLoop`] through [`EventLoop::current`].
//! The loop is leaked on creation and never torn down, so `&'static`
//! handles to it can be captured by timers, connections and cleanup hooks.
//! Its state persists across [`run`](EventLoop::run) calls.
//!
//! One iteration of the loop:
//!
//! 1. drain the queue and deliver every record in FIFO order;
//! 2. turn due timers into fire records (delivered by the next drain);
//! 3. destroy every node marked with `delete_later`;
//! 4. stop if an exit was requested, or wait until the next timer is due,
//!    work is pushed, or a short idle slice elapses.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{CallbackFailure, Error, Result};
use crate::invocation::{IntoSlotResult, InvocationOrigin, InvocationRecord, panic_message};
use crate::object::{NodeId, ObjectTree};
use crate::queue::ThreadSafeQueue;
use crate::thread_check::ThreadAffinity;
use crate::timer::{TimerCallback, TimerId, TimerKind, TimerManager};

/// Upper bound on one idle wait, so exit requests are noticed promptly.
const IDLE_SLICE: Duration = Duration::from_millis(10);

/// Every event loop ever created, by owning thread.
static LOOPS: OnceLock<RwLock<HashMap<ThreadId, &'static EventLoop>>> = OnceLock::new();

thread_local! {
    static CURRENT: Cell<Option<&'static EventLoop>> = const { Cell::new(None) };
}

fn registry() -> &'static RwLock<HashMap<ThreadId, &'static EventLoop>> {
    LOOPS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Lifecycle state of an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Never run.
    Idle,
    /// Inside `run()`.
    Running,
    /// The last `run()` stopped with this exit code.
    Stopped(i32),
}

struct LoopControl {
    state: LoopState,
    /// First exit code requested during the current run.
    exit_request: Option<i32>,
}

/// A node handle bound to the event loop that owns it.
///
/// Obtained from [`EventLoop::receiver`]; used to connect slots whose
/// lifetime follows the node (see [`Signal::connect_receiver`](crate::Signal::connect_receiver)).
#[derive(Debug, Clone, Copy)]
pub struct Receiver {
    node: NodeId,
    event_loop: &'static EventLoop,
}

impl Receiver {
    /// The receiving node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The loop queued deliveries go to.
    pub fn event_loop(&self) -> &'static EventLoop {
        self.event_loop
    }
}

/// A cooperative, single-threaded event loop.
///
/// Pushing work (`post`, queued emits, `exit`, timer start/stop) is allowed
/// from any thread. Driving the loop and changing its ownership tree must
/// happen on the owning thread.
///
/// # Example
///
/// ```
/// use signalbox_core::EventLoop;
///
/// let event_loop = EventLoop::current();
/// event_loop.post(|| println!("first"));
/// event_loop.post(move || event_loop.quit());
/// assert_eq!(event_loop.run().unwrap(), 0);
/// ```
pub struct EventLoop {
    affinity: ThreadAffinity,
    queue: ThreadSafeQueue,
    timers: Mutex<TimerManager>,
    objects: Mutex<ObjectTree>,
    control: Mutex<LoopControl>,
    /// Queued-callback failures collected since the last report.
    failures: Mutex<Vec<CallbackFailure>>,
}

impl EventLoop {
    fn new() -> Self {
        Self {
            affinity: ThreadAffinity::current(),
            queue: ThreadSafeQueue::new(),
            timers: Mutex::new(TimerManager::new()),
            objects: Mutex::new(ObjectTree::new()),
            control: Mutex::new(LoopControl {
                state: LoopState::Idle,
                exit_request: None,
            }),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// The calling thread's event loop, created on first use.
    pub fn current() -> &'static EventLoop {
        CURRENT.with(|cell| {
            if let Some(event_loop) = cell.get() {
                return event_loop;
            }
            let event_loop: &'static EventLoop = Box::leak(Box::new(EventLoop::new()));
            registry().write().insert(event_loop.thread_id(), event_loop);
            cell.set(Some(event_loop));
            tracing::debug!(
                target: "signalbox_core::event_loop",
                thread = ?event_loop.thread_id(),
                "created event loop"
            );
            event_loop
        })
    }

    /// The calling thread's event loop, if it has one already.
    pub fn try_current() -> Option<&'static EventLoop> {
        CURRENT.with(Cell::get)
    }

    /// The event loop owned by `thread`, if that thread ever created one.
    pub fn for_thread(thread: ThreadId) -> Option<&'static EventLoop> {
        registry().read().get(&thread).copied()
    }

    /// The thread that owns this loop.
    pub fn thread_id(&self) -> ThreadId {
        self.affinity.thread_id()
    }

    // -------------------------------------------------------------------------
    // Run / exit
    // -------------------------------------------------------------------------

    /// Run the loop until [`exit`](Self::exit) or [`quit`](Self::quit).
    ///
    /// Returns the exit code. If queued callbacks failed while running, the
    /// loop still runs to completion and the failures are returned as
    /// [`Error::QueuedCallbackFailed`] carrying the exit code.
    ///
    /// # Errors
    ///
    /// [`Error::WrongThread`] off the owning thread, [`Error::AlreadyRunning`]
    /// from inside a running loop. Neither changes the loop's state.
    #[tracing::instrument(skip(self), target = "signalbox_core::event_loop", level = "debug")]
    pub fn run(&self) -> Result<i32> {
        self.affinity.check()?;
        {
            let mut control = self.control.lock();
            if control.state == LoopState::Running {
                return Err(Error::AlreadyRunning);
            }
            control.state = LoopState::Running;
            control.exit_request = None;
        }
        let _reset = RunReset(self);
        tracing::debug!(target: "signalbox_core::event_loop", "event loop started");

        let code = loop {
            self.iterate();

            {
                let mut control = self.control.lock();
                if let Some(code) = control.exit_request.take() {
                    control.state = LoopState::Stopped(code);
                    break code;
                }
            }

            let wait = self
                .timers
                .lock()
                .time_until_next(Instant::now())
                .map_or(IDLE_SLICE, |until| until.min(IDLE_SLICE));
            self.queue.wait_for_work(wait);
        };

        tracing::debug!(target: "signalbox_core::event_loop", code, "event loop stopped");
        self.take_failures(Some(code))?;
        Ok(code)
    }

    /// Ask the running loop to stop with `code`.
    ///
    /// Callable from any thread; takes effect at the end of the current
    /// iteration. The first code requested during a run wins. Ignored when
    /// the loop is not running.
    pub fn exit(&self, code: i32) {
        {
            let mut control = self.control.lock();
            if control.state != LoopState::Running {
                tracing::debug!(target: "signalbox_core::event_loop", code, "exit ignored, loop not running");
                return;
            }
            match control.exit_request {
                None => control.exit_request = Some(code),
                Some(first) => {
                    tracing::debug!(
                        target: "signalbox_core::event_loop",
                        code,
                        first,
                        "exit already requested"
                    );
                }
            }
        }
        self.queue.wake();
    }

    /// Equivalent to `exit(0)`.
    pub fn quit(&self) {
        self.exit(0);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        self.control.lock().state
    }

    /// Whether the loop is inside `run()`.
    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// The code the last `run()` stopped with.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            LoopState::Stopped(code) => Some(code),
            _ => None,
        }
    }

    /// Run one non-blocking iteration outside `run()`.
    ///
    /// Delivers every record queued at the time of the call, enqueues due
    /// timer fires, and sweeps deferred deletions. Returns the number of
    /// records delivered.
    pub fn process_events(&self) -> Result<usize> {
        self.ensure_idle()?;
        let delivered = self.iterate();
        self.take_failures(None)?;
        Ok(delivered)
    }

    /// Destroy every node marked with `delete_later` now.
    ///
    /// Returns the number of nodes destroyed. A second call without new
    /// marks destroys nothing.
    pub fn process_deferred_deletions(&self) -> Result<usize> {
        self.ensure_idle()?;
        let destroyed = self.sweep_deferred_deletions();
        self.take_failures(None)?;
        Ok(destroyed)
    }

    fn ensure_idle(&self) -> Result<()> {
        self.affinity.check()?;
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    fn iterate(&self) -> usize {
        let records = self.queue.drain_all();
        let delivered = records.len();
        for record in records {
            self.deliver(record);
        }
        self.enqueue_expired_timers();
        self.sweep_deferred_deletions();
        delivered
    }

    fn deliver(&self, record: InvocationRecord) {
        if let Some(owner) = record.owner() {
            if !self.objects.lock().contains(owner) {
                tracing::trace!(
                    target: "signalbox_core::event_loop",
                    sequence = record.sequence(),
                    "dropping record of destroyed owner"
                );
                return;
            }
        }
        if let Err(failure) = record.execute() {
            tracing::warn!(target: "signalbox_core::event_loop", %failure, "queued callback failed");
            self.failures.lock().push(failure);
        }
    }

    fn enqueue_expired_timers(&self) {
        let fired = self.timers.lock().process_expired(Instant::now());
        if !fired.is_empty() {
            tracing::trace!(target: "signalbox_core::event_loop", count = fired.len(), "timers fired");
        }
        for timer in fired {
            let callback = timer.callback;
            let record = InvocationRecord::new(InvocationOrigin::Timer(timer.id), self.thread_id(), move || {
                callback()
            })
            .with_owner(timer.owner);
            self.queue.push(record);
        }
    }

    #[tracing::instrument(skip(self), target = "signalbox_core::object", level = "trace")]
    fn sweep_deferred_deletions(&self) -> usize {
        let mut destroyed = 0;
        loop {
            let batch = self.tree().begin_sweep();
            if batch.order.is_empty() {
                break;
            }
            // Hooks run unlocked: they stop timers, disconnect signals and
            // may touch the tree themselves.
            for (id, hooks) in batch.hooks {
                for hook in hooks {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(id))) {
                        let failure = CallbackFailure::new(
                            format!("cleanup of node {id:?}"),
                            format!("panicked: {}", panic_message(payload.as_ref())),
                        );
                        tracing::warn!(target: "signalbox_core::object", %failure, "cleanup hook failed");
                        self.failures.lock().push(failure);
                    }
                }
            }
            self.tree().finish_sweep(&batch.order);

            let dead: HashSet<NodeId> = batch.order.iter().copied().collect();
            let purged = self.queue.purge_owned_by(&dead);
            tracing::debug!(
                target: "signalbox_core::object",
                destroyed = batch.order.len(),
                purged,
                "deferred deletions processed"
            );
            destroyed += batch.order.len();
        }
        destroyed
    }

    fn take_failures(&self, exit_code: Option<i32>) -> Result<()> {
        let failures = std::mem::take(&mut *self.failures.lock());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::QueuedCallbackFailed { exit_code, failures })
        }
    }

    // -------------------------------------------------------------------------
    // Posting
    // -------------------------------------------------------------------------

    pub(crate) fn enqueue(&self, record: InvocationRecord) {
        self.queue.push(record);
    }

    /// Queue a closure to run on the loop thread. Callable from any thread.
    pub fn post<F, R>(&self, task: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoSlotResult,
    {
        self.queue
            .push(InvocationRecord::new(InvocationOrigin::Posted, self.thread_id(), task));
    }

    /// Queue a closure that is dropped unrun if `owner` is destroyed first.
    pub fn post_owned<F, R>(&self, owner: NodeId, task: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoSlotResult,
    {
        self.queue.push(
            InvocationRecord::new(InvocationOrigin::Posted, self.thread_id(), task).with_owner(Some(owner)),
        );
    }

    /// Number of records waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    // -------------------------------------------------------------------------
    // Timer API
    // -------------------------------------------------------------------------

    /// Start a timer whose callback runs on the loop thread.
    ///
    /// Callable from any thread. The first fire comes `interval` after the
    /// call; a repeating timer then re-arms with the same interval measured
    /// from each fire.
    pub fn start_timer<F, R>(&self, interval: Duration, kind: TimerKind, callback: F) -> TimerId
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: IntoSlotResult,
    {
        let id = self
            .timers
            .lock()
            .start(Instant::now(), interval, kind, None, wrap_timer(callback));
        self.queue.wake();
        id
    }

    /// Start a timer that is stopped when `owner` is destroyed.
    ///
    /// Fires already queued when the owner dies are dropped too.
    pub fn start_owned_timer<F, R>(
        &'static self,
        owner: NodeId,
        interval: Duration,
        kind: TimerKind,
        callback: F,
    ) -> Result<TimerId>
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: IntoSlotResult,
    {
        let mut objects = self.tree();
        if !objects.contains(owner) {
            return Err(Error::InvalidNode);
        }
        let id = self
            .timers
            .lock()
            .start(Instant::now(), interval, kind, Some(owner), wrap_timer(callback));
        objects.add_cleanup(
            owner,
            Box::new(move |_| {
                self.timers.lock().stop(id);
            }),
        )?;
        drop(objects);
        self.queue.wake();
        Ok(id)
    }

    /// Run `callback` once after `delay`.
    pub fn single_shot<F, R>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoSlotResult,
    {
        self.start_timer(delay, TimerKind::OneShot, once(callback))
    }

    /// Run `callback` once after `delay`, unless `owner` is destroyed first.
    pub fn single_shot_owned<F, R>(&'static self, owner: NodeId, delay: Duration, callback: F) -> Result<TimerId>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoSlotResult,
    {
        self.start_owned_timer(owner, delay, TimerKind::OneShot, once(callback))
    }

    /// Stop a timer. Callable from any thread.
    ///
    /// A fire that is already queued still runs.
    pub fn stop_timer(&self, id: TimerId) -> Result<()> {
        if self.timers.lock().stop(id) {
            Ok(())
        } else {
            Err(Error::InvalidTimer)
        }
    }

    /// Check if a timer is active.
    pub fn is_timer_active(&self, id: TimerId) -> bool {
        self.timers.lock().is_active(id)
    }

    /// Number of timers that will still fire.
    pub fn active_timer_count(&self) -> usize {
        self.timers.lock().active_count()
    }

    /// Time until the earliest timer is due.
    pub fn time_until_next_timer(&self) -> Option<Duration> {
        self.timers.lock().time_until_next(Instant::now())
    }

    // -------------------------------------------------------------------------
    // Ownership tree API
    // -------------------------------------------------------------------------

    fn tree(&self) -> MutexGuard<'_, ObjectTree> {
        self.affinity
            .debug_assert_same_thread("ownership tree used off its event loop thread");
        self.objects.lock()
    }

    /// Create a root node.
    pub fn create_node(&self, name: impl Into<String>) -> NodeId {
        self.tree().create_node(name)
    }

    /// Create a node owned by `parent`.
    pub fn create_child(&self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        self.tree().create_child(parent, name)
    }

    /// Move `node` under `parent`, or make it a root with `None`.
    pub fn set_parent(&self, node: NodeId, parent: Option<NodeId>) -> Result<()> {
        self.tree().set_parent(node, parent)
    }

    /// The parent of `node`.
    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>> {
        self.tree().parent(node)
    }

    /// The children of `node`, in insertion order.
    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        self.tree().children(node).map(<[NodeId]>::to_vec)
    }

    /// Whether `node` still exists.
    pub fn contains(&self, node: NodeId) -> bool {
        self.tree().contains(node)
    }

    /// The name of `node`.
    pub fn node_name(&self, node: NodeId) -> Result<String> {
        self.tree().node_name(node).map(str::to_owned)
    }

    /// A direct child of `node` with the given name.
    pub fn find_child_by_name(&self, node: NodeId, name: &str) -> Result<Option<NodeId>> {
        self.tree().find_child_by_name(node, name)
    }

    /// Whether `node` is marked for destruction.
    pub fn is_pending_deletion(&self, node: NodeId) -> bool {
        self.tree().is_pending_deletion(node)
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.tree().node_count()
    }

    /// Schedule `node` and its descendants for destruction.
    ///
    /// Nothing is destroyed until the current iteration's cleanup phase, or an
    /// explicit [`process_deferred_deletions`](Self::process_deferred_deletions).
    pub fn delete_later(&self, node: NodeId) -> Result<()> {
        self.tree().delete_later(node)
    }

    /// Run `hook` when `node` is destroyed.
    pub fn add_cleanup<F>(&self, node: NodeId, hook: F) -> Result<()>
    where
        F: FnOnce(NodeId) + Send + 'static,
    {
        self.tree().add_cleanup(node, Box::new(hook))
    }

    /// Bind `node` to this loop for receiver connections.
    pub fn receiver(&'static self, node: NodeId) -> Result<Receiver> {
        if !self.contains(node) {
            return Err(Error::InvalidNode);
        }
        Ok(Receiver {
            node,
            event_loop: self,
        })
    }

    /// Debug dump of the subtree rooted at `node`.
    pub fn dump_tree(&self, node: NodeId) -> Result<String> {
        self.tree().dump_tree(node)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.thread_id())
            .field("state", &self.control.lock().state)
            .field("pending", &self.queue.len())
            .field("timers", &self.timers.lock().active_count())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(EventLoop: Send, Sync);

/// Leaves `Running` if `run()` unwinds.
struct RunReset<'a>(&'a EventLoop);

impl Drop for RunReset<'_> {
    fn drop(&mut self) {
        let mut control = self.0.control.lock();
        if control.state == LoopState::Running {
            control.state = LoopState::Idle;
            control.exit_request = None;
        }
    }
}

fn wrap_timer<F, R>(callback: F) -> TimerCallback
where
    F: Fn() -> R + Send + Sync + 'static,
    R: IntoSlotResult,
{
    std::sync::Arc::new(move || callback().into_slot_result())
}

/// Adapt a one-shot closure to the timer's `Fn` callback.
fn once<F, R>(callback: F) -> impl Fn() -> std::result::Result<(), String> + Send + Sync + 'static
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoSlotResult,
{
    let cell = Mutex::new(Some(callback));
    move || match cell.lock().take() {
        Some(callback) => callback().into_slot_result(),
        None => Ok(()),
    }
}
