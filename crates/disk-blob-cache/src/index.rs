//! In-memory shadow of which entries exist on disk, plus the size totals

use crate::key::ResourceId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct IndexState {
    /// Resource id -> size in bytes
    entries: HashMap<ResourceId, u64>,
    /// `None` until the first rescan, and again after a full clear.
    totals: Option<Totals>,
    last_rescan: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Totals {
    size: u64,
    count: usize,
}

/// Existence index and aggregate size behind one lock.
///
/// The index may miss entries written by another instance but never keeps an
/// entry after this coordinator has seen it removed. The lock is only held
/// for map and counter updates, never across I/O.
#[derive(Debug, Default)]
pub(crate) struct CacheIndex {
    state: Mutex<IndexState>,
}

impl CacheIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn contains(&self, id: &ResourceId) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Record a committed insert. `replaced` is the size of the file the
    /// commit overwrote on disk; replacing an entry, indexed or not, swaps
    /// its size in the total instead of adding a new one.
    pub(crate) fn record_insert(&self, id: ResourceId, size: u64, replaced: Option<u64>) {
        let mut state = self.lock();
        let previous = state.entries.insert(id, size);
        if let Some(totals) = state.totals.as_mut() {
            match replaced.or(previous) {
                Some(old) => totals.size = totals.size.saturating_sub(old),
                None => totals.count += 1,
            }
            totals.size += size;
        }
    }

    /// Index an entry found on disk. Totals are untouched: a rescan already
    /// counted it.
    pub(crate) fn warm(&self, id: ResourceId, size: u64) {
        self.lock().entries.insert(id, size);
    }

    /// Forget an entry whose artifact turned out to be gone.
    pub(crate) fn prune(&self, id: &ResourceId) {
        self.lock().entries.remove(id);
    }

    /// Account for a recognised entry deleted through this coordinator.
    pub(crate) fn record_removal(&self, id: &ResourceId, size: u64) {
        let mut state = self.lock();
        state.entries.remove(id);
        if let Some(totals) = state.totals.as_mut() {
            totals.size = totals.size.saturating_sub(size);
            totals.count = totals.count.saturating_sub(1);
        }
    }

    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.totals = None;
        state.last_rescan = None;
    }

    pub(crate) fn size(&self) -> Option<u64> {
        self.lock().totals.map(|t| t.size)
    }

    pub(crate) fn count(&self) -> Option<usize> {
        self.lock().totals.map(|t| t.count)
    }

    /// True when the totals are uninitialised or older than `interval`.
    pub(crate) fn needs_rescan(&self, now: DateTime<Utc>, interval: std::time::Duration) -> bool {
        let state = self.lock();
        match (state.totals, state.last_rescan) {
            (Some(_), Some(last)) => crate::clock::age_between(now, last) > interval,
            _ => true,
        }
    }

    pub(crate) fn set_totals(&self, size: u64, count: usize, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.totals = Some(Totals { size, count });
        state.last_rescan = Some(at);
    }
}
