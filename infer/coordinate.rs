//! # Work Coordination
//!
//! Workers of one run share a single `KvStore`, an explicit coordination service
//! handed to every worker by `Arc`. It offers blocking typed `get`/`put` on string
//! keys, named barriers, atomic claim counters and a teardown that removes a key
//! once every participant has consumed it.
//!
//! Two protocols are built on it:
//!
//! - `ChunkClaims` hands out disjoint chunks of a fixed work list. Each call to
//!   `next` advances a shared counter, so a chunk has exactly one owner no matter
//!   how requests from different workers interleave.
//! - `leader_publish` lets the coordinating worker compute a singular artifact,
//!   publish it, and release it only after every participant has read it and
//!   passed the barrier.
//!
//! Handoff waits are bounded by the store timeout. A timeout poisons the store, so
//! the remaining workers fail with `Aborted` instead of hanging. Waits that span
//! computation (`Wait::UntilAbort`) have no deadline and end only on release or abort;
//! a failing or panicking worker always aborts the store, so they cannot hang.

use ahash::AHashMap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::Any;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Rank of the worker that computes and publishes singular state.
pub const COORDINATOR_RANK: usize = 0;

/// How long a blocking call may wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// At most the store timeout.
    Bounded,
    /// Until released or aborted. Used where peers may still be computing.
    UntilAbort,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinationError {
    #[error("Timed out after {waited:?} waiting on '{key}'; a worker has crashed or deadlocked.")]
    Timeout { key: String, waited: Duration },
    #[error("Coordination aborted: {0}")]
    Aborted(String),
    #[error("Key '{0}' was written more than once.")]
    DuplicateKey(String),
    #[error("Key '{0}' holds a value of a different type.")]
    TypeMismatch(String),
}

struct Published {
    value: Arc<dyn Any + Send + Sync>,
    consumed: usize,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

#[derive(Default)]
struct StoreState {
    entries: AHashMap<String, Published>,
    barriers: AHashMap<String, BarrierState>,
    /// Store-wide release counter; a recreated barrier never reuses a generation.
    epoch: u64,
    aborted: Option<String>,
}

/// Shared key-value coordination service for one run.
pub struct KvStore {
    participants: usize,
    timeout: Duration,
    state: Mutex<StoreState>,
    changed: Condvar,
    counters: DashMap<String, AtomicUsize>,
}

impl KvStore {
    pub fn new(participants: usize, timeout: Duration) -> Self {
        Self {
            participants: participants.max(1),
            timeout,
            state: Mutex::new(StoreState::default()),
            changed: Condvar::new(),
            counters: DashMap::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, CoordinationError> {
        self.state
            .lock()
            .map_err(|_| CoordinationError::Aborted("a worker panicked while holding the store".into()))
    }

    /// Waits on the condition variable until `ready` holds or the store is aborted.
    /// A bounded wait that runs out poisons the store for everyone else.
    fn wait_until<'a, F>(
        &self,
        mut guard: MutexGuard<'a, StoreState>,
        key: &str,
        wait: Wait,
        mut ready: F,
    ) -> Result<MutexGuard<'a, StoreState>, CoordinationError>
    where
        F: FnMut(&StoreState) -> bool,
    {
        let started = Instant::now();
        loop {
            if let Some(reason) = &guard.aborted {
                return Err(CoordinationError::Aborted(reason.clone()));
            }
            if ready(&guard) {
                return Ok(guard);
            }
            if wait == Wait::UntilAbort {
                guard = self
                    .changed
                    .wait(guard)
                    .map_err(|_| CoordinationError::Aborted("a worker panicked while waiting".into()))?;
                continue;
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                let reason = format!("timeout on '{key}'");
                guard.aborted = Some(reason);
                self.changed.notify_all();
                return Err(CoordinationError::Timeout {
                    key: key.to_string(),
                    waited,
                });
            }
            let (next, _) = self
                .changed
                .wait_timeout(guard, self.timeout - waited)
                .map_err(|_| CoordinationError::Aborted("a worker panicked while waiting".into()))?;
            guard = next;
        }
    }

    /// Publishes a value. The publisher counts as its first consumer.
    pub fn put<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>) -> Result<(), CoordinationError> {
        let mut state = self.lock()?;
        if let Some(reason) = &state.aborted {
            return Err(CoordinationError::Aborted(reason.clone()));
        }
        if state.entries.contains_key(key) {
            return Err(CoordinationError::DuplicateKey(key.to_string()));
        }
        state.entries.insert(
            key.to_string(),
            Published {
                value,
                consumed: 1,
            },
        );
        self.changed.notify_all();
        log::trace!("Published '{key}'");
        Ok(())
    }

    /// Blocks until `key` is published, then returns it and records one consumption.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, CoordinationError> {
        self.get_with(key, Wait::Bounded)
    }

    pub fn get_with<T: Any + Send + Sync>(
        &self,
        key: &str,
        wait: Wait,
    ) -> Result<Arc<T>, CoordinationError> {
        let guard = self.lock()?;
        let mut state = self.wait_until(guard, key, wait, |s| s.entries.contains_key(key))?;
        let entry = state
            .entries
            .get_mut(key)
            .ok_or_else(|| CoordinationError::Aborted(format!("'{key}' vanished while waiting")))?;
        let value = Arc::clone(&entry.value)
            .downcast::<T>()
            .map_err(|_| CoordinationError::TypeMismatch(key.to_string()))?;
        entry.consumed += 1;
        self.changed.notify_all();
        Ok(value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().map(|s| s.entries.contains_key(key)).unwrap_or(false)
    }

    /// Blocks until every participant has reached the barrier `name`.
    ///
    /// Barriers are reusable: each completed round advances a generation counter.
    pub fn barrier(&self, name: &str) -> Result<(), CoordinationError> {
        self.barrier_with(name, Wait::Bounded)
    }

    pub fn barrier_with(&self, name: &str, wait: Wait) -> Result<(), CoordinationError> {
        let mut state = self.lock()?;
        if let Some(reason) = &state.aborted {
            return Err(CoordinationError::Aborted(reason.clone()));
        }
        let epoch = state.epoch;
        let barrier = state
            .barriers
            .entry(name.to_string())
            .or_insert(BarrierState {
                arrived: 0,
                generation: epoch,
            });
        barrier.arrived += 1;
        let generation = barrier.generation;
        if barrier.arrived == self.participants {
            barrier.arrived = 0;
            barrier.generation = epoch + 1;
            state.epoch = epoch + 1;
            self.changed.notify_all();
            return Ok(());
        }
        // A barrier torn down after its release counts as released.
        self.wait_until(state, name, wait, |s| {
            s.barriers.get(name).is_none_or(|b| b.generation != generation)
        })?;
        Ok(())
    }

    /// Removes a published key, its claim counter and its idle barrier once every
    /// participant has consumed it.
    pub fn teardown(&self, key: &str) -> Result<(), CoordinationError> {
        let participants = self.participants;
        let guard = self.lock()?;
        let mut state = self.wait_until(guard, key, Wait::Bounded, |s| {
            s.entries.get(key).is_none_or(|e| e.consumed >= participants)
        })?;
        state.entries.remove(key);
        if state.barriers.get(key).is_some_and(|b| b.arrived == 0) {
            state.barriers.remove(key);
        }
        drop(state);
        self.counters.remove(key);
        log::trace!("Tore down '{key}'");
        Ok(())
    }

    /// Atomically reserves `chunk` units under `key` and returns the first reserved unit.
    pub fn next_claim(&self, key: &str, chunk: usize) -> usize {
        if let Some(counter) = self.counters.get(key) {
            return counter.fetch_add(chunk, Ordering::SeqCst);
        }
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(chunk, Ordering::SeqCst)
    }

    /// Removes a claim counter so the key can be reused.
    pub fn reset_claims(&self, key: &str) {
        self.counters.remove(key);
    }

    /// Poisons the store and wakes every waiter.
    pub fn abort(&self, reason: &str) {
        if let Ok(mut state) = self.state.lock() {
            if state.aborted.is_none() {
                log::error!("Aborting coordination: {reason}");
                state.aborted = Some(reason.to_string());
            }
        }
        self.changed.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().map(|s| s.aborted.is_some()).unwrap_or(true)
    }

    #[cfg(test)]
    fn barrier_count(&self) -> usize {
        self.lock().map(|s| s.barriers.len()).unwrap_or(0)
    }
}

/// Iterator over the chunks of `0..total` claimed by one worker.
pub struct ChunkClaims<'a> {
    store: &'a KvStore,
    key: String,
    total: usize,
    chunk: usize,
}

impl<'a> ChunkClaims<'a> {
    pub fn new(store: &'a KvStore, key: impl Into<String>, total: usize, chunk: usize) -> Self {
        Self {
            store,
            key: key.into(),
            total,
            chunk: chunk.max(1),
        }
    }
}

impl Iterator for ChunkClaims<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.store.is_aborted() {
            return None;
        }
        let start = self.store.next_claim(&self.key, self.chunk);
        if start >= self.total {
            return None;
        }
        let end = (start + self.chunk).min(self.total);
        log::debug!("Claimed '{}' units {start}..{end}", self.key);
        Some(start..end)
    }
}

/// Leader computes and publishes `key`; every worker returns the same shared value.
///
/// Participants block on `get` until the value is published, without a deadline
/// since the leader may still be computing. All workers then meet at a barrier named
/// after the key, after which the leader tears the key down, so a later round can
/// never observe a stale value. A failure in `compute` aborts the store before it is
/// returned.
pub fn leader_publish<T, E, F>(
    store: &KvStore,
    rank: usize,
    key: &str,
    compute: F,
) -> Result<Arc<T>, E>
where
    T: Any + Send + Sync,
    E: From<CoordinationError> + std::fmt::Display,
    F: FnOnce() -> Result<T, E>,
{
    let value = if rank == COORDINATOR_RANK {
        let value = match compute() {
            Ok(value) => Arc::new(value),
            Err(err) => {
                store.abort(&format!("leader failed to compute '{key}': {err}"));
                return Err(err);
            }
        };
        store.put(key, Arc::clone(&value))?;
        value
    } else {
        store.get_with::<T>(key, Wait::UntilAbort)?
    };
    store.barrier(key)?;
    if rank == COORDINATOR_RANK {
        store.teardown(key)?;
    }
    Ok(value)
}

/// Write-once accumulator keyed by work-unit position.
pub struct ResultAccumulator<V> {
    slots: DashMap<usize, V>,
}

impl<V> Default for ResultAccumulator<V> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<V> ResultAccumulator<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the result for `unit`. A second insert for the same unit is rejected.
    pub fn insert(&self, unit: usize, value: V) -> Result<(), CoordinationError> {
        match self.slots.entry(unit) {
            Entry::Occupied(_) => Err(CoordinationError::DuplicateKey(format!("unit {unit}"))),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes and returns the results ordered by unit, or the first missing unit.
    /// Nothing is removed unless every unit is present.
    pub fn take_ordered(&self, total: usize) -> Result<Vec<V>, usize> {
        if let Some(missing) = (0..total).find(|unit| !self.slots.contains_key(unit)) {
            return Err(missing);
        }
        Ok((0..total)
            .filter_map(|unit| self.slots.remove(&unit).map(|(_, value)| value))
            .collect())
    }
}
