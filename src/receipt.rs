//! Per-recording receipt tracking for idempotent, exactly-once batch completion.
//!
//! Tracks which batch indices of each motion recording have been durably stored so
//! that redelivered batches are detected and completion is signalled exactly once.
//! All state sits behind one mutex, which makes every check-and-set atomic with
//! respect to concurrent uploads for the same recording.
//!
//! Recordings move through `Unseen -> Receiving -> Completed`. Receiving recordings
//! live in the active map; on completion the entry moves into a bounded LRU of
//! finished recordings so that late redeliveries are still recognized as duplicates
//! while memory stays bounded.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::error::Error;

/// Outcome of recording one batch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// The index was new and the recording still has missing batches.
    Accepted,
    /// The index was already stored (or is being stored); nothing must be appended.
    Duplicate,
    /// The index was new and was the last missing one. Returned once per recording.
    Completed,
}

impl Receipt {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Receipt::Accepted => "accepted",
            Receipt::Duplicate => "duplicate",
            Receipt::Completed => "completed",
        }
    }
}

/// Observable state of a tracked recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    /// Some but not all batches have been stored.
    Receiving {
        /// Number of distinct batch indices stored so far.
        received: usize,
        /// Total number of batches declared by the recording.
        batch_count: u16,
    },
    /// Every batch has been stored and completion was signalled.
    Completed,
}

/// Receipt bitmap of one receiving recording.
#[derive(Debug)]
struct ReceiptState {
    batch_count: u16,
    /// `received[i]` is true iff batch `i` has been durably appended.
    received: Vec<bool>,
    /// `in_flight[i]` is true while batch `i` is reserved but not yet committed.
    in_flight: Vec<bool>,
    /// Number of `false` entries in `received`.
    missing: usize,
    last_touched: Instant,
}

impl ReceiptState {
    fn new(batch_count: u16, now: Instant) -> Self {
        let n = batch_count as usize;
        Self {
            batch_count,
            received: vec![false; n],
            in_flight: vec![false; n],
            missing: n,
            last_touched: now,
        }
    }

    fn has_in_flight(&self) -> bool {
        self.in_flight.iter().any(|b| *b)
    }
}

/// Lock-protected tracker state.
struct Inner {
    active: HashMap<String, ReceiptState>,
    finished: LruCache<String, u16>,
}

fn check_geometry(name: &str, index: u16, count: u16, known_count: Option<u16>) -> Result<(), Error> {
    if count == 0 {
        return Err(Error::MalformedFrame("batch count must be at least 1".into()));
    }
    match known_count {
        Some(known) if known != count => {
            return Err(Error::MalformedFrame(format!(
                "batch count {count} for {name} differs from previously declared {known}"
            )));
        }
        _ => {}
    }
    if index >= count {
        return Err(Error::MalformedFrame(format!(
            "batch index {index} out of range for batch count {count}"
        )));
    }
    Ok(())
}

impl Inner {
    /// Returns `Ok(true)` if the index was reserved, `Ok(false)` if it is a duplicate.
    fn reserve(&mut self, name: &str, index: u16, count: u16) -> Result<bool, Error> {
        if let Some(&known) = self.finished.get(name) {
            check_geometry(name, index, count, Some(known))?;
            return Ok(false);
        }

        let now = Instant::now();
        let known = self.active.get(name).map(|s| s.batch_count);
        check_geometry(name, index, count, known)?;

        let state = self
            .active
            .entry(name.to_string())
            .or_insert_with(|| ReceiptState::new(count, now));
        state.last_touched = now;

        let i = index as usize;
        if state.received[i] || state.in_flight[i] {
            return Ok(false);
        }
        state.in_flight[i] = true;
        Ok(true)
    }

    fn commit(&mut self, name: &str, index: u16) -> Receipt {
        let Some(state) = self.active.get_mut(name) else {
            tracing::warn!(recording = %name, batch_index = index, "commit for untracked recording");
            return Receipt::Accepted;
        };
        let i = index as usize;
        state.in_flight[i] = false;
        if state.received[i] {
            return Receipt::Duplicate;
        }
        state.received[i] = true;
        state.missing -= 1;
        state.last_touched = Instant::now();

        if state.missing > 0 {
            return Receipt::Accepted;
        }
        let count = state.batch_count;
        self.active.remove(name);
        self.finished.put(name.to_string(), count);
        Receipt::Completed
    }

    fn release(&mut self, name: &str, index: u16) {
        if let Some(state) = self.active.get_mut(name) {
            state.in_flight[index as usize] = false;
        }
    }
}

/// Shared receipt tracker for all motion recordings.
///
/// Cheap to share via `Arc`. Heart-rate recordings never pass through it.
pub struct ReceiptTracker {
    inner: Mutex<Inner>,
}

/// Result of [`ReceiptTracker::reserve`].
pub enum Reservation {
    /// The index is new; store the batch, then [`ReceiptGuard::commit`].
    Fresh(ReceiptGuard),
    /// The index is already stored or being stored by a concurrent upload.
    Duplicate,
}

/// Exclusive claim on one batch index of one recording.
///
/// Committing marks the index as stored. Dropping the guard without committing
/// (e.g. because the append failed) releases the claim so a retry can succeed.
pub struct ReceiptGuard {
    tracker: Arc<ReceiptTracker>,
    name: String,
    index: u16,
    committed: bool,
}

impl ReceiptGuard {
    /// Mark the reserved index as durably stored.
    ///
    /// # Returns
    ///
    /// [`Receipt::Completed`] if this was the recording's last missing batch,
    /// [`Receipt::Accepted`] otherwise.
    pub fn commit(mut self) -> Receipt {
        self.committed = true;
        self.tracker.lock().commit(&self.name, self.index)
    }
}

impl Drop for ReceiptGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.tracker.lock().release(&self.name, self.index);
        }
    }
}

impl ReceiptTracker {
    /// Create a tracker that remembers up to `finished_capacity` completed recordings.
    pub fn new(finished_capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                finished: LruCache::new(finished_capacity),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("receipt tracker mutex poisoned")
    }

    /// Atomically record `batch_index` as stored and report the outcome.
    ///
    /// On first sight of `name`, allocates a bitmap of `batch_count` entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFrame`] if `batch_count` is zero, differs from the
    /// count first declared for `name`, or `batch_index` is outside it.
    pub fn mark_and_check(
        &self,
        name: &str,
        batch_index: u16,
        batch_count: u16,
    ) -> Result<Receipt, Error> {
        let mut inner = self.lock();
        if !inner.reserve(name, batch_index, batch_count)? {
            return Ok(Receipt::Duplicate);
        }
        Ok(inner.commit(name, batch_index))
    }

    /// Claim `batch_index` before storing it.
    ///
    /// This is the two-phase form of [`mark_and_check`](Self::mark_and_check): the
    /// index is only marked as stored once the returned guard is committed, so an
    /// append that fails never leaves a false receipt behind. A concurrent upload of
    /// the same index sees [`Reservation::Duplicate`] while the claim is held.
    ///
    /// # Errors
    ///
    /// Same as [`mark_and_check`](Self::mark_and_check).
    pub fn reserve(
        self: &Arc<Self>,
        name: &str,
        batch_index: u16,
        batch_count: u16,
    ) -> Result<Reservation, Error> {
        if !self.lock().reserve(name, batch_index, batch_count)? {
            return Ok(Reservation::Duplicate);
        }
        Ok(Reservation::Fresh(ReceiptGuard {
            tracker: Arc::clone(self),
            name: name.to_string(),
            index: batch_index,
            committed: false,
        }))
    }

    /// Current state of `name`, or `None` if it is not tracked.
    pub fn state(&self, name: &str) -> Option<RecordingState> {
        let inner = self.lock();
        if let Some(state) = inner.active.get(name) {
            return Some(RecordingState::Receiving {
                received: state.received.iter().filter(|b| **b).count(),
                batch_count: state.batch_count,
            });
        }
        inner
            .finished
            .contains(name)
            .then_some(RecordingState::Completed)
    }

    /// Number of recordings currently receiving batches.
    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    /// Drop receiving recordings that have not been touched for longer than `max_idle`.
    ///
    /// Recordings with a batch in flight are kept. Returns the number evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.active.len();
        inner.active.retain(|name, state| {
            let keep =
                state.has_in_flight() || now.duration_since(state.last_touched) <= max_idle;
            if !keep {
                tracing::info!(
                    recording = %name,
                    missing = state.missing,
                    "Evicting idle recording"
                );
            }
            keep
        });
        before - inner.active.len()
    }
}
