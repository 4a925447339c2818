//! Worker pattern for dedicated background thread processing.
//!
//! A [`Worker`] owns one thread with a bounded task queue. Tasks run
//! sequentially; each result is emitted on the worker's `result_ready`
//! signal, and `finished` is emitted once when the thread winds down. Both
//! signals are emitted on the worker thread, so connect them with
//! [`ConnectionType::Queued`](crate::ConnectionType::Queued) to have the
//! slots run on an event loop.
//!
//! # Example
//!
//! ```
//! use signalbox_core::{EventLoop, worker::Worker};
//!
//! let event_loop = EventLoop::current();
//! let worker = Worker::<u32>::new().unwrap();
//!
//! worker.on_result().connect_queued(|n| println!("result {n}"));
//! worker.on_finished().connect_queued(move |_| event_loop.quit());
//!
//! for n in 0..3 {
//!     worker.send(move || n * n);
//! }
//! worker.stop();
//!
//! assert_eq!(event_loop.run().unwrap(), 0);
//! worker.join();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::signal::Signal;

/// Default capacity for the worker's task queue.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How often an idle worker re-checks for a stop request.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for creating a Worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for the worker thread.
    pub name: String,
    /// Stack size for the worker thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
    /// Capacity of the task queue.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "signalbox-worker".to_string(),
            stack_size: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl WorkerConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for creating Workers with custom configuration.
#[derive(Debug, Default)]
pub struct WorkerBuilder {
    config: WorkerConfig,
}

impl WorkerBuilder {
    /// Create a new WorkerBuilder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the stack size for the worker thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Set the task queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Build and start the worker.
    pub fn build<T: Clone + Send + 'static>(self) -> Result<Worker<T>> {
        Worker::with_config(self.config)
    }
}

/// State shared between the Worker handle and its thread.
struct WorkerState {
    running: AtomicBool,
    stop_requested: AtomicBool,
    pending_tasks: AtomicUsize,
    shutdown_condvar: Condvar,
    shutdown_mutex: Mutex<()>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            pending_tasks: AtomicUsize::new(0),
            shutdown_condvar: Condvar::new(),
            shutdown_mutex: Mutex::new(()),
        }
    }

    fn signal_shutdown(&self) {
        let _guard = self.shutdown_mutex.lock();
        self.shutdown_condvar.notify_all();
    }
}

enum WorkerTask<T> {
    /// Run and emit the result on `result_ready`.
    Execute(Box<dyn FnOnce() -> T + Send>),
    /// Run and hand the result back to a blocked sender.
    ExecuteSync {
        task: Box<dyn FnOnce() -> T + Send>,
        sender: Sender<T>,
    },
    /// Run and post the result to a callback on the given loop.
    ExecuteWithCallback {
        task: Box<dyn FnOnce() -> T + Send>,
        callback: Box<dyn FnOnce(T) + Send>,
        target: &'static EventLoop,
    },
    Shutdown,
}

/// A dedicated worker thread with its own task queue.
///
/// # Type Parameter
///
/// - `T`: The result type produced by tasks.
pub struct Worker<T: Send + 'static> {
    /// Taken by `stop`, so no task can be queued behind the shutdown.
    task_sender: Mutex<Option<Sender<WorkerTask<T>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: Arc<WorkerState>,
    result_ready: Signal<T>,
    finished: Signal<()>,
}

impl<T: Send + 'static> Worker<T> {
    /// Check if the worker thread is still processing.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Whether [`stop`](Self::stop) has been called.
    ///
    /// Long tasks can poll this through [`Worker::stop_flag`] to finish early.
    pub fn is_stop_requested(&self) -> bool {
        self.state.stop_requested.load(Ordering::Acquire)
    }

    /// A flag that turns `true` once the worker is asked to stop.
    pub fn stop_flag(&self) -> StopFlag {
        StopFlag {
            state: self.state.clone(),
        }
    }

    /// Get the number of tasks queued or in progress.
    pub fn pending_tasks(&self) -> usize {
        self.state.pending_tasks.load(Ordering::Acquire)
    }

    /// The `result_ready` signal, emitted on the worker thread per task.
    pub fn on_result(&self) -> &Signal<T> {
        &self.result_ready
    }

    /// The `finished` signal, emitted on the worker thread after the last task.
    pub fn on_finished(&self) -> &Signal<()> {
        &self.finished
    }

    /// Send a task whose result goes to `callback` instead of the signal.
    ///
    /// The callback runs on the calling thread's event loop.
    ///
    /// Returns `true` if the task was queued successfully.
    pub fn send_with_callback<F, C>(&self, task: F, callback: C) -> bool
    where
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        self.submit(WorkerTask::ExecuteWithCallback {
            task: Box::new(task),
            callback: Box::new(callback),
            target: EventLoop::current(),
        })
    }

    /// Send a task and block until it completes, returning the result.
    ///
    /// Returns `None` if the worker has been stopped.
    pub fn send_sync<F>(&self, task: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_sender, result_receiver) = bounded(1);
        let queued = self.submit(WorkerTask::ExecuteSync {
            task: Box::new(task),
            sender: result_sender,
        });
        if queued { result_receiver.recv().ok() } else { None }
    }

    fn submit(&self, task: WorkerTask<T>) -> bool {
        let sender = self.task_sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        if !self.is_running() {
            return false;
        }

        self.state.pending_tasks.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.state.pending_tasks.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Request the worker to stop after processing remaining tasks.
    ///
    /// Non-blocking. No new tasks are accepted afterwards; use
    /// [`join`](Self::join) to wait for the thread.
    pub fn stop(&self) {
        let mut sender = self.task_sender.lock();
        self.state.stop_requested.store(true, Ordering::Release);
        if let Some(sender) = sender.take() {
            // A full queue drops the marker; the disconnect still ends the loop.
            let _ = sender.try_send(WorkerTask::Shutdown);
        }
    }

    /// Wait for the worker thread to finish.
    ///
    /// Returns `true` if the worker was joined successfully, `false` if
    /// already joined or the thread panicked.
    pub fn join(&self) -> bool {
        let mut handle = self.handle.lock();
        if let Some(h) = handle.take() {
            h.join().is_ok()
        } else {
            false
        }
    }

    /// Stop the worker and wait for it to finish.
    pub fn stop_and_join(&self) -> bool {
        self.stop();
        self.join()
    }

    /// Wait for the worker to finish with a timeout.
    ///
    /// Returns `true` if the worker finished within the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.state.shutdown_mutex.lock();
        if !self.is_running() {
            return true;
        }
        let result = self.state.shutdown_condvar.wait_for(&mut guard, timeout);
        !result.timed_out() || !self.is_running()
    }
}

impl<T: Clone + Send + 'static> Worker<T> {
    /// Create a new worker with default configuration.
    ///
    /// The worker thread starts immediately.
    pub fn new() -> Result<Self> {
        Self::with_config(WorkerConfig::default())
    }

    /// Create a new worker with custom configuration.
    pub fn with_config(config: WorkerConfig) -> Result<Self> {
        let (sender, receiver) = bounded(config.queue_capacity);
        let state = Arc::new(WorkerState::new());
        let result_ready = Signal::named("result_ready");
        let finished = Signal::named("finished");

        let thread_state = state.clone();
        let thread_result = result_ready.clone();
        let thread_finished = finished.clone();

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || {
                worker_loop(&receiver, &thread_state, &thread_result);
                thread_state.running.store(false, Ordering::Release);
                if let Err(e) = thread_finished.emit(()) {
                    tracing::warn!(target: "signalbox_core::worker", error = %e, "finished slot failed");
                }
                thread_state.signal_shutdown();
            })
            .map_err(Error::WorkerSpawn)?;

        tracing::debug!(target: "signalbox_core::worker", name = %config.name, "worker started");
        Ok(Self {
            task_sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            state,
            result_ready,
            finished,
        })
    }

    /// Send a task to the worker for execution.
    ///
    /// The result is emitted on `result_ready`. Returns `true` if the task
    /// was queued, `false` if the worker has been stopped or the queue is full.
    pub fn send<F>(&self, task: F) -> bool
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(WorkerTask::Execute(Box::new(task)))
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        // Request shutdown without blocking.
        self.stop();
    }
}

/// Read-only view of a worker's stop request.
#[derive(Clone)]
pub struct StopFlag {
    state: Arc<WorkerState>,
}

impl StopFlag {
    /// Whether the worker has been asked to stop.
    pub fn is_set(&self) -> bool {
        self.state.stop_requested.load(Ordering::Acquire)
    }
}

fn worker_loop<T: Clone + Send + 'static>(
    receiver: &Receiver<WorkerTask<T>>,
    state: &WorkerState,
    result_ready: &Signal<T>,
) {
    loop {
        match receiver.recv_timeout(STOP_POLL_INTERVAL) {
            Ok(WorkerTask::Shutdown) => {
                // Drain what was queued before the stop request.
                while let Ok(task) = receiver.try_recv() {
                    run_task(task, state, result_ready);
                }
                break;
            }
            Ok(task) => run_task(task, state, result_ready),
            Err(RecvTimeoutError::Timeout) => {
                if state.stop_requested.load(Ordering::Acquire)
                    && state.pending_tasks.load(Ordering::Acquire) == 0
                {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_task<T: Clone + Send + 'static>(task: WorkerTask<T>, state: &WorkerState, result_ready: &Signal<T>) {
    match task {
        WorkerTask::Execute(task) => {
            let result = task();
            if let Err(e) = result_ready.emit(result) {
                tracing::warn!(target: "signalbox_core::worker", error = %e, "result slot failed");
            }
        }
        WorkerTask::ExecuteSync { task, sender } => {
            let _ = sender.send(task());
        }
        WorkerTask::ExecuteWithCallback { task, callback, target } => {
            let result = task();
            target.post(move || callback(result));
        }
        WorkerTask::Shutdown => return,
    }
    state.pending_tasks.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionType;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn test_worker_creation() {
        let worker = Worker::<i32>::new().unwrap();
        assert!(worker.is_running());
        assert_eq!(worker.pending_tasks(), 0);
        assert!(worker.stop_and_join());
        assert!(!worker.is_running());
    }

    #[test]
    fn test_worker_with_config() {
        let worker = WorkerBuilder::new()
            .name("test-worker")
            .queue_capacity(64)
            .build::<i32>()
            .unwrap();

        assert!(worker.is_running());
        worker.stop_and_join();
    }

    #[test]
    fn test_direct_results_arrive_in_order_on_worker_thread() {
        let worker = Worker::<i32>::new().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        worker.on_result().connect_direct(move |&value| {
            received_clone.lock().push((value, thread::current().id()));
        });

        for i in 0..10 {
            worker.send(move || i);
        }
        worker.stop_and_join();

        let values = received.lock();
        assert_eq!(values.iter().map(|(v, _)| *v).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert!(values.iter().all(|(_, t)| *t != thread::current().id()));
    }

    #[test]
    fn test_queued_results_and_finished_reach_loop() {
        let event_loop = EventLoop::current();
        let worker = Worker::<i32>::new().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        worker.on_result().connect_with_type(
            move |&value| {
                received_clone.lock().push((value, thread::current().id()));
            },
            ConnectionType::Queued,
        );
        worker.on_finished().connect_queued(move |_| event_loop.quit());

        worker.send(|| 42);
        worker.send(|| 100);
        worker.stop();

        assert_eq!(event_loop.run().unwrap(), 0);
        assert_eq!(
            *received.lock(),
            vec![(42, thread::current().id()), (100, thread::current().id())]
        );
        worker.join();
    }

    #[test]
    fn test_send_with_callback() {
        let event_loop = EventLoop::current();
        let worker = Worker::<String>::new().unwrap();
        let received = Arc::new(Mutex::new(None));

        let received_clone = received.clone();
        assert!(worker.send_with_callback(
            || "hello".to_string(),
            move |result| {
                *received_clone.lock() = Some(result);
                event_loop.quit();
            },
        ));

        assert_eq!(event_loop.run().unwrap(), 0);
        assert_eq!(*received.lock(), Some("hello".to_string()));
        worker.stop_and_join();
    }

    #[test]
    fn test_graceful_shutdown() {
        let worker = Worker::<i32>::new().unwrap();
        let counter = Arc::new(AtomicI32::new(0));

        for _ in 0..5 {
            let counter_clone = counter.clone();
            worker.send(move || {
                thread::sleep(Duration::from_millis(10));
                counter_clone.fetch_add(1, Ordering::SeqCst);
                1
            });
        }

        worker.stop();
        worker.join();

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(worker.pending_tasks(), 0);
    }

    #[test]
    fn test_send_after_stop() {
        let worker = Worker::<i32>::new().unwrap();
        worker.stop();

        assert!(!worker.send(|| 42));
        assert!(worker.send_sync(|| 42).is_none());

        worker.join();
    }

    #[test]
    fn test_send_sync() {
        let worker = Worker::<i32>::new().unwrap();

        let result = worker.send_sync(|| {
            thread::sleep(Duration::from_millis(10));
            42
        });

        assert_eq!(result, Some(42));
        worker.stop_and_join();
    }

    #[test]
    fn test_wait_timeout() {
        let worker = Worker::<i32>::new().unwrap();

        assert!(!worker.wait_timeout(Duration::from_millis(50)));

        worker.stop();
        assert!(worker.wait_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn test_stop_flag() {
        let worker = Worker::<String>::new().unwrap();
        let flag = worker.stop_flag();
        assert!(!flag.is_set());

        let iterations = Arc::new(AtomicI32::new(0));
        let iter_clone = iterations.clone();
        let task_flag = flag.clone();
        worker.send(move || {
            for i in 0..100 {
                if task_flag.is_set() {
                    return format!("stopped at {i}");
                }
                iter_clone.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
            }
            "completed".to_string()
        });

        thread::sleep(Duration::from_millis(50));
        worker.stop();
        assert!(flag.is_set());
        assert!(worker.is_stop_requested());
        worker.join();

        assert!(iterations.load(Ordering::SeqCst) < 100);
    }

    #[test]
    fn test_send_racing_stop_never_strands_a_task() {
        for _ in 0..20 {
            let worker = Arc::new(Worker::<usize>::new().unwrap());
            let ran = Arc::new(AtomicUsize::new(0));

            let senders: Vec<_> = (0..4)
                .map(|_| {
                    let worker = worker.clone();
                    let ran = ran.clone();
                    thread::spawn(move || {
                        let mut accepted = 0;
                        for i in 0..50 {
                            let ran = ran.clone();
                            if worker.send(move || {
                                ran.fetch_add(1, Ordering::SeqCst);
                                i
                            }) {
                                accepted += 1;
                            }
                        }
                        accepted
                    })
                })
                .collect();

            thread::sleep(Duration::from_micros(200));
            worker.stop();
            let accepted: usize = senders.into_iter().map(|h| h.join().unwrap()).sum();
            assert!(worker.join());

            assert_eq!(ran.load(Ordering::SeqCst), accepted);
            assert_eq!(worker.pending_tasks(), 0);
            assert!(!worker.send(|| 0));
        }
    }
}
