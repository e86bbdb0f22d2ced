//! Write/delete serialization per shard
//!
//! Deletes against a shard must observe either all of a concurrent write's
//! points or none of them. Each shard gets an [`EpochTracker`]: writers
//! allocate a generation and learn which delete guards are pending;
//! deleters install a [`Guard`] and wait for every write whose generation
//! was allocated before the install.
//!
//! The ordering rules this produces:
//!
//! - a write that finished before a guard was installed is fully ordered
//!   before the delete;
//! - a write that started after the install sees the guard, and waits on it
//!   when its point batch could be affected;
//! - two concurrent deletes wait for each other's prior writes but not for
//!   each other; they are ordered by guard install order.

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::types::{Point, TimeRange};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// An immutable description of a pending delete.
///
/// A guard *matches* a batch of points when removal of any point in the
/// batch is possible. Matching is conservative: a spurious match costs a
/// wait, a missed match would lose the atomicity guarantee.
#[derive(Clone)]
pub struct Guard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    range: TimeRange,
    /// Sorted measurement names; empty means every measurement.
    names: Vec<String>,
    condition: Option<Expr>,
    released: watch::Sender<bool>,
}

impl Guard {
    /// Create a guard covering `[min, max]` for the given measurements
    /// (empty = all) under an optional condition.
    pub fn new(min: i64, max: i64, names: Vec<String>, condition: Option<Expr>) -> Self {
        let mut names = names;
        names.sort_unstable();
        let (released, _) = watch::channel(false);
        Self {
            inner: Arc::new(GuardInner {
                range: TimeRange::new(min, max),
                names,
                condition,
                released,
            }),
        }
    }

    /// True when the pending delete could remove any point of `points`.
    pub fn matches(&self, points: &[Point]) -> bool {
        points.iter().any(|p| self.matches_point(p))
    }

    fn matches_point(&self, point: &Point) -> bool {
        if !self.inner.range.contains(point.timestamp) {
            return false;
        }
        if !self.inner.names.is_empty()
            && self
                .inner
                .names
                .binary_search_by(|n| n.as_str().cmp(&point.measurement))
                .is_err()
        {
            return false;
        }
        match &self.inner.condition {
            // Unknown truth values count as a potential match.
            Some(cond) => cond.matches_tags(&point.measurement, &point.tags) != Some(false),
            None => true,
        }
    }

    /// Block until the guard is released by its delete, or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.inner.released.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped; the delete is gone.
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => return Err(Error::Canceled),
            }
        }
    }

    fn release(&self) {
        self.inner.released.send_replace(true);
    }

    fn same_as(&self, other: &Guard) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("range", &self.inner.range)
            .field("names", &self.inner.names)
            .field("condition", &self.inner.condition.is_some())
            .finish()
    }
}

struct TrackerState {
    next_gen: u64,
    /// Generations of writes currently in flight.
    active: BTreeSet<u64>,
    guards: Vec<Guard>,
}

/// Serializes writes and deletes that may conflict on one shard.
pub struct EpochTracker {
    state: Mutex<TrackerState>,
    /// Bumped on every completed write so delete waiters can re-check.
    write_done: watch::Sender<u64>,
}

impl Default for EpochTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochTracker {
    /// A tracker with no writes or guards outstanding.
    pub fn new() -> Self {
        let (write_done, _) = watch::channel(0);
        Self {
            state: Mutex::new(TrackerState {
                next_gen: 0,
                active: BTreeSet::new(),
                guards: Vec::new(),
            }),
            write_done,
        }
    }

    /// Enter the tracker as a writer.
    ///
    /// Returns the guards installed at entry and a permit that marks the
    /// write finished when dropped. The caller must [`Guard::wait`] on
    /// every returned guard that [`Guard::matches`] its batch before
    /// touching the shard.
    pub fn start_write(self: &Arc<Self>) -> (Vec<Guard>, WritePermit) {
        let mut state = self.state.lock();
        let gen = state.next_gen;
        state.next_gen += 1;
        state.active.insert(gen);
        let guards = state.guards.clone();
        (
            guards,
            WritePermit {
                tracker: Arc::clone(self),
                gen,
            },
        )
    }

    /// Install `guard` and return a waiter for the writes that must finish
    /// before the delete may run.
    pub fn wait_delete(self: &Arc<Self>, guard: Guard) -> DeleteWaiter {
        let mut state = self.state.lock();
        // Writes allocated after this point observe the guard themselves.
        let barrier = state.next_gen;
        state.guards.push(guard.clone());
        DeleteWaiter {
            tracker: Arc::clone(self),
            guard: Some(guard),
            barrier,
        }
    }

    fn end_write(&self, gen: u64) {
        let mut state = self.state.lock();
        state.active.remove(&gen);
        drop(state);
        self.write_done.send_modify(|n| *n += 1);
    }

    fn remove_guard(&self, guard: &Guard) {
        let mut state = self.state.lock();
        state.guards.retain(|g| !g.same_as(guard));
        drop(state);
        guard.release();
    }

    fn writes_drained_below(&self, barrier: u64) -> bool {
        let state = self.state.lock();
        match state.active.iter().next() {
            Some(&oldest) => oldest >= barrier,
            None => true,
        }
    }

    #[cfg(test)]
    fn guard_count(&self) -> usize {
        self.state.lock().guards.len()
    }
}

impl std::fmt::Debug for EpochTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EpochTracker")
            .field("next_gen", &state.next_gen)
            .field("active_writes", &state.active.len())
            .field("guards", &state.guards.len())
            .finish()
    }
}

/// Marks a write in flight; dropping it ends the write.
pub struct WritePermit {
    tracker: Arc<EpochTracker>,
    gen: u64,
}

impl WritePermit {
    /// The generation allocated to this write.
    pub fn generation(&self) -> u64 {
        self.gen
    }
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        self.tracker.end_write(self.gen);
    }
}

/// Waits out prior writes for one delete; dropping it removes the guard.
pub struct DeleteWaiter {
    tracker: Arc<EpochTracker>,
    guard: Option<Guard>,
    barrier: u64,
}

impl DeleteWaiter {
    /// Block until every write allocated before the guard install has
    /// finished, or `cancel` fires. On cancellation the guard stays
    /// installed until the waiter is dropped.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.tracker.write_done.subscribe();
        loop {
            if self.tracker.writes_drained_below(self.barrier) {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => return Err(Error::Canceled),
            }
        }
    }

    /// Remove the guard, releasing any writers blocked on it.
    pub fn done(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.tracker.remove_guard(&guard);
        }
    }
}

impl Drop for DeleteWaiter {
    fn drop(&mut self) {
        self.release();
    }
}
