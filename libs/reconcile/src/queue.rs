//! Dedup rate-limited work queue.
//!
//! The queue turns a noisy stream of "something changed about key K"
//! notifications into a stream of work items with these guarantees:
//!
//! - **Coalescing**: a key waiting for a worker is queued once, no matter
//!   how many times it is added.
//! - **One in flight per key**: a key handed out by [`WorkQueue::get`] is not
//!   handed out again until [`WorkQueue::done`]. Adds that arrive meanwhile
//!   mark the key dirty and it is re-queued when the worker finishes. A
//!   rate-limited add is remembered and the key is delayed at `done`.
//! - **Backoff**: [`WorkQueue::add_rate_limited`] parks a key in the delayed
//!   set for a duration chosen by the [`RateLimiter`].
//! - **Drain on shutdown**: after [`WorkQueue::shut_down`] no new work is
//!   accepted but queued and delayed keys are still delivered.
//!
//! Every key is in at most one of the pending, processing and delayed sets.
//! All state, including the rate limiter, lives behind a single mutex; a
//! [`Notify`] wakes callers blocked in `get`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::key::Key;
use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};

/// Work queue shared by event producers and reconcile workers.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Work recorded for a key while a worker owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    None,
    /// Added while processing; goes back to pending on `done`.
    Requeue,
    /// Scheduled while processing; delayed until the given time on `done`.
    RequeueAt(Instant),
}

#[derive(Debug)]
struct QueueState {
    /// Keys waiting for a worker, oldest first.
    pending: VecDeque<Key>,
    pending_set: HashSet<Key>,

    /// Keys owned by a worker, with what to do once the worker is done.
    processing: HashMap<Key, Followup>,

    /// Fire time of every delayed key.
    delayed: HashMap<Key, Instant>,

    /// Min-heap over `delayed`. Entries whose fire time no longer matches
    /// `delayed` are stale and skipped.
    timers: BinaryHeap<Reverse<(Instant, Key)>>,

    shutting_down: bool,

    limiter: Box<dyn RateLimiter>,
}

impl QueueState {
    /// Insert a key as if it had just been added, ignoring shutdown.
    fn insert(&mut self, key: Key) -> bool {
        if self.delayed.contains_key(&key) {
            return false;
        }

        if let Some(followup) = self.processing.get_mut(&key) {
            // A pending retry keeps its backoff, just as `add` on a delayed key does.
            if *followup == Followup::None {
                *followup = Followup::Requeue;
            }
            return false;
        }

        if !self.pending_set.insert(key.clone()) {
            return false;
        }

        self.pending.push_back(key);
        true
    }

    fn schedule(&mut self, key: Key, ready_at: Instant) -> bool {
        if self.pending_set.contains(&key) {
            return false;
        }

        if let Some(followup) = self.processing.get_mut(&key) {
            match *followup {
                Followup::Requeue => {}
                Followup::RequeueAt(existing) if existing <= ready_at => {}
                _ => *followup = Followup::RequeueAt(ready_at),
            }
            return false;
        }

        match self.delayed.get(&key) {
            Some(existing) if *existing <= ready_at => false,
            _ => {
                self.delayed.insert(key.clone(), ready_at);
                self.timers.push(Reverse((ready_at, key)));
                true
            }
        }
    }

    /// Move every delayed key whose fire time has passed into pending.
    fn promote_expired(&mut self, now: Instant) -> bool {
        let mut promoted = false;

        while let Some(Reverse((ready_at, _))) = self.timers.peek() {
            if *ready_at > now {
                break;
            }

            let Some(Reverse((ready_at, key))) = self.timers.pop() else {
                break;
            };

            if self.delayed.get(&key) != Some(&ready_at) {
                continue;
            }

            self.delayed.remove(&key);
            trace!(key = %key, "Delayed key is ready");
            promoted |= self.insert(key);
        }

        promoted
    }

    /// Earliest fire time among live delayed keys.
    fn next_ready_at(&mut self) -> Option<Instant> {
        while let Some(Reverse((ready_at, key))) = self.timers.peek() {
            if self.delayed.get(key) == Some(ready_at) {
                return Some(*ready_at);
            }
            self.timers.pop();
        }
        None
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.delayed.is_empty() && self.processing.is_empty()
    }
}

/// Longest delay the queue will actually wait; larger delays are clamped.
const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn deadline(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_SCHEDULE_DELAY))
        .unwrap_or(now)
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(default_controller_rate_limiter())
    }
}

impl WorkQueue {
    /// Create a queue that uses `limiter` for [`WorkQueue::add_rate_limited`].
    pub fn new(limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                pending_set: HashSet::new(),
                processing: HashMap::new(),
                delayed: HashMap::new(),
                timers: BinaryHeap::new(),
                shutting_down: false,
                limiter,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // No code path panics while holding the lock, so a poisoned state is
        // still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` for processing.
    ///
    /// No-op after shutdown or while the key is waiting out a backoff. If the
    /// key is being processed it is marked dirty and re-queued by `done`.
    pub fn add(&self, key: Key) {
        let mut state = self.lock();
        if state.shutting_down {
            trace!(key = %key, "Queue shutting down, dropping add");
            return;
        }

        if state.insert(key) {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Queue `key` once `delay` has elapsed, without touching its retry count.
    ///
    /// A key that is already delayed keeps the earlier of the two fire times.
    /// A pending key is left alone. A processing key becomes delayed when its
    /// worker calls `done`, still firing at `now + delay` from this call,
    /// unless it was re-added meanwhile and goes straight back to pending.
    pub fn add_after(&self, key: Key, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let mut state = self.lock();
        if state.shutting_down {
            return;
        }

        if state.schedule(key, deadline(delay)) {
            drop(state);
            // A waiter may need to shorten its sleep.
            self.notify.notify_waiters();
        }
    }

    /// Queue `key` after the delay chosen by the rate limiter.
    ///
    /// Each call counts as one more failure for the key until
    /// [`WorkQueue::forget`] is called. No-op after shutdown.
    pub fn add_rate_limited(&self, key: Key) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }

        let delay = state.limiter.when(&key);
        debug!(
            key = %key,
            delay_ms = delay.as_millis() as u64,
            requeues = state.limiter.num_requeues(&key),
            "Scheduling retry"
        );

        let scheduled = if delay.is_zero() {
            state.insert(key)
        } else {
            state.schedule(key, deadline(delay))
        };

        if scheduled {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Wait for the next key to process.
    ///
    /// Returns `None` once the queue has been shut down and every pending,
    /// delayed and in-flight key has been accounted for. The caller owns the
    /// returned key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<Key> {
        loop {
            let (notified, ready_at) = {
                let mut state = self.lock();
                state.promote_expired(Instant::now());

                if let Some(key) = state.pending.pop_front() {
                    state.pending_set.remove(&key);
                    state.processing.insert(key.clone(), Followup::None);
                    return Some(key);
                }

                if state.shutting_down && state.is_drained() {
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }

                // Registered before the lock is released so no wakeup is lost.
                (self.notify.notified(), state.next_ready_at())
            };

            match ready_at {
                Some(ready_at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(ready_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a key returned by [`WorkQueue::get`].
    ///
    /// If the key was added while it was being processed it goes to the back
    /// of the pending queue. If it was scheduled while being processed it is
    /// delayed until the requested time.
    pub fn done(&self, key: &Key) {
        let mut state = self.lock();
        let Some(followup) = state.processing.remove(key) else {
            debug!(key = %key, "done called for a key that is not processing");
            return;
        };

        match followup {
            Followup::None => {}
            Followup::Requeue => {
                trace!(key = %key, "Re-queueing key added while processing");
                state.insert(key.clone());
            }
            Followup::RequeueAt(ready_at) => {
                trace!(key = %key, "Delaying key scheduled while processing");
                if ready_at <= Instant::now() {
                    state.insert(key.clone());
                } else {
                    state.schedule(key.clone(), ready_at);
                }
            }
        }

        drop(state);
        self.notify.notify_waiters();
    }

    /// Clear the retry history of `key`.
    pub fn forget(&self, key: &Key) {
        self.lock().limiter.forget(key);
    }

    /// Number of failures recorded for `key` since the last `forget`.
    pub fn num_requeues(&self, key: &Key) -> u32 {
        self.lock().limiter.num_requeues(key)
    }

    /// Stop accepting new work and let queued work drain.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        debug!(
            pending = state.pending.len(),
            delayed = state.delayed.len(),
            processing = state.processing.len(),
            "Work queue shutting down"
        );
        drop(state);
        self.notify.notify_waiters();
    }

    /// Returns true once [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Discard every delayed key. Returns how many were discarded.
    ///
    /// Lets a shut-down queue finish without waiting out long backoffs.
    pub fn drop_delayed(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.delayed.len();
        state.delayed.clear();
        state.timers.clear();
        drop(state);
        self.notify.notify_waiters();
        dropped
    }

    /// Number of keys ready for a worker.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        if state.promote_expired(Instant::now()) {
            drop(state);
            self.notify.notify_waiters();
            return self.lock().pending.len();
        }
        state.pending.len()
    }

    /// Returns true if no key is ready for a worker.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys waiting out a delay.
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Number of keys currently owned by a worker.
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }
}
