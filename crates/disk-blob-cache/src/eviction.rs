//! Eviction ordering and the delete passes that enforce size and age limits

use crate::clock::{age_between, Clock};
use crate::events::{CacheErrorCategory, CacheErrorLogger};
use crate::index::CacheIndex;
use crate::storage::{Storage, StorageItem};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides which items go first when the cache has to shrink.
///
/// `Ordering::Less` means `a` is evicted before `b`. Implemented for plain
/// closures with the same signature.
pub trait EvictionOrder: Send + Sync {
    fn compare(&self, a: &StorageItem, b: &StorageItem, now: DateTime<Utc>) -> Ordering;
}

impl<F> EvictionOrder for F
where
    F: Fn(&StorageItem, &StorageItem, DateTime<Utc>) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &StorageItem, b: &StorageItem, now: DateTime<Utc>) -> Ordering {
        self(a, b, now)
    }
}

/// Least recently touched first.
#[derive(Debug, Default, Clone, Copy)]
pub struct OldestFirst;

impl EvictionOrder for OldestFirst {
    fn compare(&self, a: &StorageItem, b: &StorageItem, _now: DateTime<Utc>) -> Ordering {
        a.timestamp().cmp(&b.timestamp())
    }
}

/// Highest `age_weight * age_secs + size_weight * bytes` first.
#[derive(Debug, Clone, Copy)]
pub struct ScoreBased {
    pub age_weight: f64,
    pub size_weight: f64,
}

impl ScoreBased {
    pub fn new(age_weight: f64, size_weight: f64) -> Self {
        Self {
            age_weight,
            size_weight,
        }
    }

    fn score(&self, item: &StorageItem, now: DateTime<Utc>) -> f64 {
        let age_secs = age_between(now, item.timestamp()).as_secs_f64();
        self.age_weight * age_secs + self.size_weight * item.size() as f64
    }
}

impl EvictionOrder for ScoreBased {
    fn compare(&self, a: &StorageItem, b: &StorageItem, now: DateTime<Utc>) -> Ordering {
        self.score(b, now).total_cmp(&self.score(a, now))
    }
}

/// Entries removed by one pass. Foreign files are deleted but not counted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub entry_count: usize,
    pub total_bytes: u64,
}

impl EvictionOutcome {
    fn add(&mut self, bytes: u64) {
        self.entry_count += 1;
        self.total_bytes += bytes;
    }
}

/// Result of an age-based purge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AgePurge {
    pub outcome: EvictionOutcome,
    /// Smallest age among items left behind, zero if none are.
    pub youngest_remaining: Duration,
}

/// Runs scan-and-delete passes against the backend. Callers serialise passes.
pub(crate) struct Evictor {
    storage: Arc<dyn Storage>,
    order: Arc<dyn EvictionOrder>,
    clock: Arc<dyn Clock>,
    error_logger: Arc<dyn CacheErrorLogger>,
}

impl Evictor {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        order: Arc<dyn EvictionOrder>,
        clock: Arc<dyn Clock>,
        error_logger: Arc<dyn CacheErrorLogger>,
    ) -> Self {
        Self {
            storage,
            order,
            clock,
            error_logger,
        }
    }

    async fn items(&self) -> Option<Vec<StorageItem>> {
        match self.storage.entries().await {
            Ok(items) => Some(items),
            Err(e) => {
                self.error_logger
                    .log_error(CacheErrorCategory::Enumerate, "listing cache entries", &e);
                None
            }
        }
    }

    /// Recompute size and count from disk. Foreign files are not counted.
    pub(crate) async fn rescan(&self, index: &CacheIndex) -> bool {
        let Some(items) = self.items().await else {
            return false;
        };
        let (size, count) = items
            .iter()
            .filter(|item| item.resource_id().is_some())
            .fold((0u64, 0usize), |(size, count), item| {
                (size + item.size(), count + 1)
            });
        index.set_totals(size, count, self.clock.now());
        debug!(size, count, "Recalculated cache size");
        true
    }

    /// Delete items in eviction order until the aggregate size is at or
    /// below `target`.
    pub(crate) async fn evict_to(&self, index: &CacheIndex, target: u64) -> EvictionOutcome {
        let mut outcome = EvictionOutcome::default();
        let Some(mut items) = self.items().await else {
            return outcome;
        };
        let now = self.clock.now();
        items.sort_by(|a, b| self.order.compare(a, b, now));

        for item in items {
            match index.size() {
                Some(size) if size > target => {}
                _ => break,
            }
            self.remove_item(index, &item, &mut outcome).await;
        }
        outcome
    }

    /// Delete every item older than `max_age`, whatever the cache size.
    pub(crate) async fn evict_older_than(&self, index: &CacheIndex, max_age: Duration) -> AgePurge {
        let mut purge = AgePurge::default();
        let Some(items) = self.items().await else {
            return purge;
        };
        let now = self.clock.now();
        let mut youngest: Option<Duration> = None;

        for item in items {
            let age = age_between(now, item.timestamp());
            if age > max_age && self.remove_item(index, &item, &mut purge.outcome).await {
                continue;
            }
            youngest = Some(youngest.map_or(age, |y| y.min(age)));
        }

        purge.youngest_remaining = youngest.unwrap_or(Duration::ZERO);
        purge
    }

    /// Returns false if the delete failed and the item is still there.
    async fn remove_item(
        &self,
        index: &CacheIndex,
        item: &StorageItem,
        outcome: &mut EvictionOutcome,
    ) -> bool {
        match self.storage.remove(item).await {
            Ok(freed) => {
                if let Some(id) = item.resource_id() {
                    if freed > 0 {
                        index.record_removal(id, freed);
                        outcome.add(freed);
                    } else {
                        index.prune(id);
                    }
                }
                true
            }
            Err(e) => {
                self.error_logger
                    .log_error(CacheErrorCategory::Eviction, "deleting evicted item", &e);
                false
            }
        }
    }
}
