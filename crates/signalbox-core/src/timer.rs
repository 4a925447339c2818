//! Timer system for signalbox.
//!
//! Provides one-shot and repeating timers. The [`TimerManager`] does not run
//! callbacks itself: the event loop asks it for expired timers and turns each
//! fire into an invocation record on its queue, so timer fires and queued
//! signals share one ordering.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slotmap::{SlotMap, new_key_type};

use crate::object::NodeId;

new_key_type! {
    /// A unique identifier for a timer.
    pub struct TimerId;
}

/// The type of timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once after the specified duration.
    OneShot,
    /// Fires repeatedly at the specified interval.
    Repeating,
}

pub(crate) type TimerCallback = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Internal timer data.
struct TimerData {
    /// When this timer should next fire.
    next_fire: Instant,
    /// The interval, reused when a repeating timer re-arms.
    interval: Duration,
    kind: TimerKind,
    /// Start order, used to break ties between timers due at the same instant.
    sequence: u64,
    /// Node whose destruction stops this timer.
    owner: Option<NodeId>,
    callback: TimerCallback,
}

/// An entry in the timer queue (min-heap by fire time, then start order).
#[derive(Debug, Clone, Copy)]
struct TimerQueueEntry {
    id: TimerId,
    fire_time: Instant,
    sequence: u64,
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_time == other.fire_time && self.sequence == other.sequence
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the earliest fire
        // time (then the earliest start) on top.
        other
            .fire_time
            .cmp(&self.fire_time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A timer that has expired and must be delivered.
pub(crate) struct FiredTimer {
    pub id: TimerId,
    pub owner: Option<NodeId>,
    pub callback: TimerCallback,
}

/// Manages all timers of one event loop.
pub struct TimerManager {
    timers: SlotMap<TimerId, TimerData>,
    queue: BinaryHeap<TimerQueueEntry>,
    next_sequence: u64,
}

impl TimerManager {
    /// Create a new timer manager.
    pub fn new() -> Self {
        Self {
            timers: SlotMap::with_key(),
            queue: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    /// Register a timer that first fires `interval` after `now`.
    pub(crate) fn start(
        &mut self,
        now: Instant,
        interval: Duration,
        kind: TimerKind,
        owner: Option<NodeId>,
        callback: TimerCallback,
    ) -> TimerId {
        let next_fire = now + interval;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let id = self.timers.insert(TimerData {
            next_fire,
            interval,
            kind,
            sequence,
            owner,
            callback,
        });
        self.queue.push(TimerQueueEntry {
            id,
            fire_time: next_fire,
            sequence,
        });

        tracing::trace!(target: "signalbox_core::timer", ?id, ?interval, ?kind, "timer started");
        id
    }

    /// Stop and remove a timer.
    ///
    /// Returns `false` if the timer was unknown or had already finished.
    pub fn stop(&mut self, id: TimerId) -> bool {
        let removed = self.timers.remove(id).is_some();
        if removed {
            tracing::trace!(target: "signalbox_core::timer", ?id, "timer stopped");
        }
        removed
    }

    /// Check if a timer is currently active.
    pub fn is_active(&self, id: TimerId) -> bool {
        self.timers.contains_key(id)
    }

    /// Get the duration until the next timer fires, if any.
    ///
    /// Returns `None` if there are no active timers.
    pub fn time_until_next(&mut self, now: Instant) -> Option<Duration> {
        self.discard_stale_entries();
        self.queue
            .peek()
            .map(|entry| entry.fire_time.saturating_duration_since(now))
    }

    /// Collect every timer due at `now`, earliest first.
    ///
    /// One-shot timers are removed; repeating timers are re-armed for
    /// `now + interval` once the batch is collected, so a zero interval
    /// fires at most once per call.
    #[tracing::instrument(skip(self), target = "signalbox_core::timer", level = "trace")]
    pub(crate) fn process_expired(&mut self, now: Instant) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        let mut rearm = Vec::new();

        while let Some(entry) = self.queue.peek().copied() {
            if entry.fire_time > now {
                break;
            }
            self.queue.pop();

            let Some(timer) = self.timers.get_mut(entry.id) else {
                continue;
            };
            if timer.next_fire != entry.fire_time {
                continue;
            }

            tracing::trace!(target: "signalbox_core::timer", id = ?entry.id, "timer fired");
            fired.push(FiredTimer {
                id: entry.id,
                owner: timer.owner,
                callback: timer.callback.clone(),
            });

            let kind = timer.kind;
            match kind {
                TimerKind::OneShot => {
                    self.timers.remove(entry.id);
                }
                TimerKind::Repeating => {
                    timer.next_fire = now + timer.interval;
                    rearm.push(TimerQueueEntry {
                        id: entry.id,
                        fire_time: timer.next_fire,
                        sequence: timer.sequence,
                    });
                }
            }
        }

        self.queue.extend(rearm);
        fired
    }

    /// Get the number of active timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    fn discard_stale_entries(&mut self) {
        while let Some(entry) = self.queue.peek() {
            let live = self
                .timers
                .get(entry.id)
                .is_some_and(|t| t.next_fire == entry.fire_time);
            if live {
                break;
            }
            self.queue.pop();
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
