//! Expiry Scheduler
//!
//! A single background task owns a min-heap of deadlines. Everyone else talks
//! to it through an unbounded channel, so the heap needs no lock of its own.
//!
//! ```text
//!   schedule / cancel ──┐
//!                       ▼
//!              ┌─────────────────┐   tick (100ms)   ┌──────────────────┐
//!              │  timer task     │ ───────────────▶ │ spawn_blocking   │
//!              │  heap + slots   │                  │   callback()     │
//!              │  key -> TaskId  │ ◀─── Fired ───── │                  │
//!              └─────────────────┘                  └──────────────────┘
//! ```
//!
//! ## Lazy deletion
//!
//! Re-arming or cancelling a key does not search the heap. The old task's
//! slot is marked invalid and its heap entry is discarded when it reaches the
//! top. Each slot has exactly one heap entry, so a slot is recycled as soon as
//! that entry is popped. [`TaskId`] carries the slot generation, which keeps a
//! late `Fired` or `Cancel` from touching the task that reused the slot.
//!
//! Callbacks run at or after their deadline, never before, and must
//! re-validate the key state themselves.

use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// Default interval between heap sweeps.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Work to run once a key's deadline has passed.
pub type ExpiryCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one scheduled task: an arena slot plus the generation it had
/// when the task was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    slot: usize,
    generation: u64,
}

enum Message {
    Schedule {
        key: Bytes,
        deadline: SystemTime,
        callback: ExpiryCallback,
    },
    Cancel {
        key: Bytes,
    },
    Clear,
    Fired {
        key: Bytes,
        id: TaskId,
    },
}

struct Slot {
    generation: u64,
    valid: bool,
    key: Bytes,
    callback: Option<ExpiryCallback>,
}

/// A task whose deadline has passed and which is still valid.
pub(crate) struct DueTask {
    pub key: Bytes,
    pub id: TaskId,
    pub callback: ExpiryCallback,
}

/// Heap, slot arena and key index. Owned by the timer task only.
#[derive(Default)]
pub(crate) struct TimerState {
    heap: BinaryHeap<Reverse<(SystemTime, TaskId)>>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<Bytes, TaskId>,
}

impl TimerState {
    fn slot_matches(&self, id: TaskId) -> bool {
        self.slots
            .get(id.slot)
            .is_some_and(|slot| slot.generation == id.generation)
    }

    pub(crate) fn schedule(
        &mut self,
        key: Bytes,
        deadline: SystemTime,
        callback: ExpiryCallback,
    ) -> TaskId {
        self.cancel(&key);

        let slot = Slot {
            generation: 0,
            valid: true,
            key: key.clone(),
            callback: Some(callback),
        };
        let id = match self.free.pop() {
            Some(index) => {
                let generation = self.slots[index].generation;
                self.slots[index] = Slot { generation, ..slot };
                TaskId {
                    slot: index,
                    generation,
                }
            }
            None => {
                self.slots.push(slot);
                TaskId {
                    slot: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };

        self.index.insert(key, id);
        self.heap.push(Reverse((deadline, id)));
        id
    }

    /// Invalidates the key's current task, if any.
    pub(crate) fn cancel(&mut self, key: &[u8]) -> bool {
        let Some(id) = self.index.remove(key) else {
            return false;
        };
        if self.slot_matches(id) {
            let slot = &mut self.slots[id.slot];
            slot.valid = false;
            slot.callback = None;
        }
        true
    }

    /// Invalidates every pending task. Heap entries are dropped lazily.
    pub(crate) fn clear(&mut self) -> usize {
        let cleared = self.index.len();
        for (_, id) in self.index.drain() {
            if let Some(slot) = self.slots.get_mut(id.slot) {
                if slot.generation == id.generation {
                    slot.valid = false;
                    slot.callback = None;
                }
            }
        }
        cleared
    }

    /// Drops the index entry for a finished task unless the key has been
    /// re-armed since.
    pub(crate) fn fired(&mut self, key: &[u8], id: TaskId) {
        if self.index.get(key) == Some(&id) {
            self.index.remove(key);
        }
    }

    /// Pops every entry whose deadline is at or before `now`. Invalid tasks
    /// are discarded; valid ones are returned for the caller to run.
    pub(crate) fn take_due(&mut self, now: SystemTime) -> Vec<DueTask> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();

            let slot = &mut self.slots[id.slot];
            let callback = slot.callback.take();
            let key = std::mem::take(&mut slot.key);
            let valid = slot.valid;
            slot.valid = false;
            slot.generation += 1;
            self.free.push(id.slot);

            if let (true, Some(callback)) = (valid, callback) {
                due.push(DueTask { key, id, callback });
            }
        }
        due
    }

    pub(crate) fn pending(&self) -> usize {
        self.index.len()
    }
}

/// Handle to the timer task. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpiryScheduler {
    tx: mpsc::UnboundedSender<Message>,
    shutdown_tx: watch::Sender<bool>,
}

impl ExpiryScheduler {
    /// Spawns the timer task on the current Tokio runtime.
    pub fn start(tick: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(timer_loop(tick, rx, tx.clone(), shutdown_rx));
        debug!(tick_ms = tick.as_millis() as u64, "expiry scheduler started");

        Self { tx, shutdown_tx }
    }

    /// Arms (or re-arms) the key's expiry. Any previous task for the key
    /// becomes invalid.
    pub fn schedule(&self, key: Bytes, deadline: SystemTime, callback: ExpiryCallback) {
        let message = Message::Schedule {
            key,
            deadline,
            callback,
        };
        if self.tx.send(message).is_err() {
            debug!("expiry scheduler is stopped, schedule ignored");
        }
    }

    pub fn cancel(&self, key: Bytes) {
        if self.tx.send(Message::Cancel { key }).is_err() {
            debug!("expiry scheduler is stopped, cancel ignored");
        }
    }

    /// Cancels every armed key, as after a flush.
    pub fn clear(&self) {
        if self.tx.send(Message::Clear).is_err() {
            debug!("expiry scheduler is stopped, clear ignored");
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Schedule { key, deadline, .. } => f
                .debug_struct("Schedule")
                .field("key", key)
                .field("deadline", deadline)
                .finish(),
            Message::Cancel { key } => f.debug_struct("Cancel").field("key", key).finish(),
            Message::Clear => f.write_str("Clear"),
            Message::Fired { key, id } => f
                .debug_struct("Fired")
                .field("key", key)
                .field("id", id)
                .finish(),
        }
    }
}

async fn timer_loop(
    tick: Duration,
    mut rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::UnboundedSender<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut state = TimerState::default();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let due = state.take_due(SystemTime::now());
                if !due.is_empty() {
                    trace!(count = due.len(), pending = state.pending(), "running expiry callbacks");
                }
                for task in due {
                    let tx = tx.clone();
                    tokio::task::spawn_blocking(move || {
                        (task.callback)();
                        let _ = tx.send(Message::Fired { key: task.key, id: task.id });
                    });
                }
            }
            message = rx.recv() => match message {
                Some(Message::Schedule { key, deadline, callback }) => {
                    trace!(key = ?key, "expiry scheduled");
                    state.schedule(key, deadline, callback);
                }
                Some(Message::Cancel { key }) => {
                    state.cancel(&key);
                }
                Some(Message::Clear) => {
                    let cleared = state.clear();
                    debug!(cleared, "expiry tasks cleared");
                }
                Some(Message::Fired { key, id }) => state.fired(&key, id),
                None => return,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!(pending = state.pending(), "expiry scheduler stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> ExpiryCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn at(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn test_due_tasks_pop_in_deadline_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut state = TimerState::default();
        state.schedule(Bytes::from("late"), at(300), counter_callback(&counter));
        state.schedule(Bytes::from("early"), at(100), counter_callback(&counter));

        assert!(state.take_due(at(50)).is_empty());
        let due = state.take_due(at(150));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, Bytes::from("early"));
        let due = state.take_due(at(1000));
        assert_eq!(due[0].key, Bytes::from("late"));
    }

    #[test]
    fn test_rearm_invalidates_previous_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut state = TimerState::default();
        let first = state.schedule(Bytes::from("k"), at(100), counter_callback(&counter));
        let second = state.schedule(Bytes::from("k"), at(200), counter_callback(&counter));
        assert_ne!(first, second);
        assert_eq!(state.pending(), 1);

        // The stale entry is discarded when popped.
        assert!(state.take_due(at(150)).is_empty());
        let due = state.take_due(at(250));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, second);
    }

    #[test]
    fn test_cancel_and_fired_bookkeeping() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut state = TimerState::default();
        state.schedule(Bytes::from("k"), at(100), counter_callback(&counter));
        assert!(state.cancel(b"k"));
        assert!(!state.cancel(b"k"));
        assert!(state.take_due(at(200)).is_empty());

        let id = state.schedule(Bytes::from("k"), at(300), counter_callback(&counter));
        let due = state.take_due(at(300));
        assert_eq!(due.len(), 1);

        // Re-armed before the Fired message arrived: index must keep the new task.
        let newer = state.schedule(Bytes::from("k"), at(900), counter_callback(&counter));
        state.fired(b"k", id);
        assert_eq!(state.pending(), 1);
        state.fired(b"k", newer);
        assert_eq!(state.pending(), 0);
    }

    #[test]
    fn test_reused_slot_is_not_cancelled_by_stale_id() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut state = TimerState::default();
        let old = state.schedule(Bytes::from("a"), at(10), counter_callback(&counter));
        for task in state.take_due(at(10)) {
            (task.callback)();
        }

        // "b" reuses the slot with a bumped generation.
        let reused = state.schedule(Bytes::from("b"), at(20), counter_callback(&counter));
        assert_eq!(reused.slot, old.slot);
        assert_ne!(reused.generation, old.generation);

        // "a" still has a stale index entry until Fired; cancelling it must not kill "b".
        state.cancel(b"a");
        let due = state.take_due(at(20));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, Bytes::from("b"));
        for task in due {
            (task.callback)();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_invalidates_every_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut state = TimerState::default();
        state.schedule(Bytes::from("a"), at(100), counter_callback(&counter));
        state.schedule(Bytes::from("b"), at(200), counter_callback(&counter));
        assert_eq!(state.clear(), 2);
        assert_eq!(state.pending(), 0);
        assert!(state.take_due(at(1000)).is_empty());

        // Slots freed by the discarded entries are reusable.
        state.schedule(Bytes::from("c"), at(1100), counter_callback(&counter));
        let due = state.take_due(at(1100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, Bytes::from("c"));
    }

    #[tokio::test]
    async fn test_scheduler_clear_drops_pending_callbacks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = ExpiryScheduler::start(Duration::from_millis(10));

        let soon = SystemTime::now() + Duration::from_millis(30);
        scheduler.schedule(Bytes::from("a"), soon, counter_callback(&counter));
        scheduler.schedule(Bytes::from("b"), soon, counter_callback(&counter));
        scheduler.clear();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scheduler_runs_callbacks_after_deadline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = ExpiryScheduler::start(Duration::from_millis(10));

        let soon = SystemTime::now() + Duration::from_millis(30);
        scheduler.schedule(Bytes::from("a"), soon, counter_callback(&counter));
        scheduler.schedule(Bytes::from("b"), soon, counter_callback(&counter));
        scheduler.cancel(Bytes::from("b"));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = ExpiryScheduler::start(Duration::from_millis(10));
            scheduler.schedule(
                Bytes::from("k"),
                SystemTime::now() + Duration::from_millis(50),
                counter_callback(&counter),
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
