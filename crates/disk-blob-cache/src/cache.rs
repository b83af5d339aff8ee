//! Cache coordinator tying the index, eviction passes and storage together

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, CacheParams};
use crate::error::{CacheError, Result};
use crate::events::{
    CacheErrorCategory, CacheErrorLogger, CacheEventListener, EvictionReason,
    NoOpCacheEventListener, TracingErrorLogger,
};
use crate::eviction::{EvictionOrder, EvictionOutcome, Evictor, OldestFirst};
use crate::index::CacheIndex;
use crate::key::{CacheKey, ResourceId};
use crate::storage::{BlobResource, FileStorage, Storage};
use crate::trim::{DiskTrimmable, NoOpTrimRegistry, TrimLevel, TrimRegistry};
use crate::types::CacheStats;
use crate::writer::WriterCallback;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A versioned blob cache over a [`Storage`] backend.
///
/// Inserts to different keys never wait on each other. Scan-and-delete
/// passes (size eviction, age purge, clear, trim) are serialised by a single
/// async lock that ordinary reads and non-evicting inserts never take.
pub struct DiskBlobCache {
    storage: Arc<dyn Storage>,
    index: CacheIndex,
    evictor: Evictor,
    params: CacheParams,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn CacheEventListener>,
    error_logger: Arc<dyn CacheErrorLogger>,
    eviction_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

pub struct DiskBlobCacheBuilder {
    storage: Arc<dyn Storage>,
    params: CacheParams,
    listener: Arc<dyn CacheEventListener>,
    error_logger: Arc<dyn CacheErrorLogger>,
    order: Arc<dyn EvictionOrder>,
    clock: Arc<dyn Clock>,
    trim_registry: Arc<dyn TrimRegistry>,
}

impl DiskBlobCacheBuilder {
    pub fn event_listener(mut self, listener: Arc<dyn CacheEventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn error_logger(mut self, error_logger: Arc<dyn CacheErrorLogger>) -> Self {
        self.error_logger = error_logger;
        self
    }

    /// Ordering used by size eviction. Defaults to [`OldestFirst`].
    pub fn eviction_order(mut self, order: Arc<dyn EvictionOrder>) -> Self {
        self.order = order;
        self
    }

    /// Time source for ages and the size refresh schedule. Should match the
    /// backend's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registry the cache registers itself with on build.
    pub fn trim_registry(mut self, registry: Arc<dyn TrimRegistry>) -> Self {
        self.trim_registry = registry;
        self
    }

    pub fn build(self) -> Result<Arc<DiskBlobCache>> {
        self.params.validate()?;
        if self.storage.version() != self.params.schema_version {
            return Err(CacheError::Config(format!(
                "storage version {} does not match schema version {}",
                self.storage.version(),
                self.params.schema_version
            )));
        }

        let evictor = Evictor::new(
            self.storage.clone(),
            self.order,
            self.clock.clone(),
            self.error_logger.clone(),
        );
        let cache = Arc::new(DiskBlobCache {
            storage: self.storage,
            index: CacheIndex::new(),
            evictor,
            params: self.params,
            clock: self.clock,
            listener: self.listener,
            error_logger: self.error_logger,
            eviction_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });

        let weak: Weak<DiskBlobCache> = Arc::downgrade(&cache);
        self.trim_registry.register(weak);
        Ok(cache)
    }
}

impl DiskBlobCache {
    pub fn builder(storage: Arc<dyn Storage>, params: CacheParams) -> DiskBlobCacheBuilder {
        DiskBlobCacheBuilder {
            storage,
            params,
            listener: Arc::new(NoOpCacheEventListener),
            error_logger: Arc::new(TracingErrorLogger),
            order: Arc::new(OldestFirst),
            clock: Arc::new(SystemClock),
            trim_registry: Arc::new(NoOpTrimRegistry),
        }
    }

    /// Create a cache with default collaborators
    pub fn new(storage: Arc<dyn Storage>, params: CacheParams) -> Result<Arc<Self>> {
        Self::builder(storage, params).build()
    }

    /// Create a file-backed cache from configuration
    pub fn from_config(config: &CacheConfig) -> Result<Arc<Self>> {
        let params = config.params()?;
        let storage = FileStorage::new(&config.cache_dir, params.schema_version);
        info!(
            cache_dir = ?config.cache_dir,
            schema_version = params.schema_version,
            low_watermark = params.low_watermark,
            high_watermark = params.high_watermark,
            "Opening disk cache"
        );
        Self::new(Arc::new(storage), params)
    }

    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    /// Whether the backend can currently store anything. Checked live.
    pub fn is_enabled(&self) -> bool {
        self.storage.is_enabled()
    }

    fn resource_ids<'a>(&'a self, key: &'a CacheKey) -> impl Iterator<Item = ResourceId> + 'a {
        key.candidates()
            .iter()
            .map(move |candidate| self.storage.resolve(candidate))
    }

    /// In-memory check only. May miss entries this instance has not seen yet.
    pub fn contains_indexed(&self, key: &CacheKey) -> bool {
        self.resource_ids(key).any(|id| self.index.contains(&id))
    }

    /// Index check falling back to disk. A disk hit is added to the index.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        if self.contains_indexed(key) {
            return true;
        }

        for id in self.resource_ids(key) {
            match self.storage.resource(&id).await {
                Ok(Some(resource)) => {
                    self.index.warm(id, resource.size());
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    self.error_logger
                        .log_error(CacheErrorCategory::ReadFile, "checking entry", &e);
                }
            }
        }
        false
    }

    /// Like [`get`](Self::get) without handing out the resource or emitting
    /// hit and miss events. Refreshes the entry's timestamp.
    pub async fn probe(&self, key: &CacheKey) -> bool {
        matches!(self.locate(key).await, Ok(Some(_)))
    }

    /// Look the key up on disk, refreshing its timestamp on a hit.
    pub async fn get(&self, key: &CacheKey) -> Option<BlobResource> {
        match self.locate(key).await {
            Ok(Some(resource)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.listener.on_hit();
                debug!(key = %key, size = resource.size(), "Cache hit");
                Some(resource)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.listener.on_miss();
                debug!(key = %key, "Cache miss");
                None
            }
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.listener.on_read_failure();
                None
            }
        }
    }

    /// First candidate present on disk. Candidates found missing are
    /// pruned from the index.
    async fn locate(&self, key: &CacheKey) -> Result<Option<BlobResource>> {
        let mut failure = None;

        for id in self.resource_ids(key) {
            let resource = match self.storage.resource(&id).await {
                Ok(Some(resource)) => resource,
                Ok(None) => {
                    self.index.prune(&id);
                    continue;
                }
                Err(e) => {
                    self.error_logger
                        .log_error(CacheErrorCategory::ReadFile, "reading entry", &e);
                    failure = Some(e);
                    continue;
                }
            };

            match self.storage.touch(&id).await {
                Ok(true) => {}
                // Removed between the lookup and the touch
                Ok(false) => {
                    self.index.prune(&id);
                    continue;
                }
                Err(e) => {
                    self.error_logger.log_error(
                        CacheErrorCategory::GenericIo,
                        "refreshing entry timestamp",
                        &e,
                    );
                }
            }

            self.index.warm(id, resource.size());
            return Ok(Some(resource));
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Write a new entry under the key's first candidate.
    ///
    /// Runs size eviction first if the cache is above its high watermark.
    /// The entry becomes visible only once the writer has finished and the
    /// staged bytes are committed; a failing writer leaves nothing behind.
    pub async fn insert<W>(&self, key: &CacheKey, writer: &W) -> Result<BlobResource>
    where
        W: WriterCallback + ?Sized,
    {
        self.listener.on_write_attempt();

        if !self.storage.is_enabled() {
            self.listener.on_write_failure();
            return Err(CacheError::Disabled);
        }

        self.maybe_evict().await;

        let id = self.storage.resolve(key.primary());
        let mut pending = match self.storage.begin_write(&id).await {
            Ok(pending) => pending,
            Err(e) => {
                self.error_logger.log_error(
                    CacheErrorCategory::WriteCreateTempFile,
                    "creating staged write",
                    &e,
                );
                self.listener.on_write_failure();
                return Err(e);
            }
        };

        if let Err(e) = WriterCallback::write(writer, pending.sink()).await {
            if let Err(abort_err) = pending.abort().await {
                self.error_logger.log_error(
                    CacheErrorCategory::DeleteFile,
                    "discarding failed write",
                    &abort_err,
                );
            }
            self.error_logger
                .log_error(CacheErrorCategory::WriteCallback, "writing entry", &e);
            self.listener.on_write_failure();
            return Err(CacheError::Writer(Box::new(e)));
        }

        let committed = match pending.commit().await {
            Ok(committed) => committed,
            Err(e) => {
                self.listener.on_write_failure();
                return Err(e);
            }
        };

        let resource = committed.resource;
        self.index
            .record_insert(id, resource.size(), committed.replaced);
        self.listener.on_write_success(resource.size());
        debug!(key = %key, size = resource.size(), "Inserted entry");
        Ok(resource)
    }

    fn above(&self, watermark: u64) -> bool {
        self.index.size().is_some_and(|size| size > watermark)
    }

    fn needs_rescan(&self) -> bool {
        self.index
            .needs_rescan(self.clock.now(), self.params.size_refresh_interval)
    }

    async fn maybe_evict(&self) {
        if !self.needs_rescan() && !self.above(self.params.high_watermark) {
            return;
        }

        let _guard = self.eviction_lock.lock().await;
        if self.needs_rescan() {
            self.evictor.rescan(&self.index).await;
        }
        if self.above(self.params.high_watermark) {
            let outcome = self
                .evictor
                .evict_to(&self.index, self.params.low_watermark)
                .await;
            self.report_eviction(EvictionReason::CacheFull, outcome);
        }
    }

    fn report_eviction(&self, reason: EvictionReason, outcome: EvictionOutcome) {
        if outcome.entry_count == 0 {
            return;
        }
        info!(
            reason = %reason,
            entries = outcome.entry_count,
            bytes = outcome.total_bytes,
            "Evicted cache entries"
        );
        self.listener
            .on_eviction(reason, outcome.entry_count, outcome.total_bytes);
    }

    /// Delete the entry behind every candidate of `key`. Returns true if
    /// anything was removed.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let mut outcome = EvictionOutcome::default();

        for id in self.resource_ids(key) {
            match self.storage.remove_resource(&id).await {
                Ok(0) => self.index.prune(&id),
                Ok(freed) => {
                    self.index.record_removal(&id, freed);
                    outcome.entry_count += 1;
                    outcome.total_bytes += freed;
                }
                Err(e) => {
                    self.error_logger
                        .log_error(CacheErrorCategory::DeleteFile, "removing entry", &e);
                }
            }
        }

        self.report_eviction(EvictionReason::UserForced, outcome);
        outcome.entry_count > 0
    }

    /// Delete every item older than `max_age`, whatever the cache size.
    ///
    /// Returns the age of the youngest item left, or zero if none are.
    pub async fn clear_old_entries(&self, max_age: Duration) -> Duration {
        let _guard = self.eviction_lock.lock().await;
        let purge = self.evictor.evict_older_than(&self.index, max_age).await;
        self.report_eviction(EvictionReason::ContentStale, purge.outcome);
        purge.youngest_remaining
    }

    /// Delete everything in this version's namespace and forget the totals.
    pub async fn clear_all(&self) {
        let _guard = self.eviction_lock.lock().await;
        if let Err(e) = self.storage.clear_all().await {
            self.error_logger
                .log_error(CacheErrorCategory::GenericIo, "clearing cache", &e);
        }
        self.index.clear();
        info!(schema_version = self.params.schema_version, "Cleared disk cache");
    }

    /// Aggregate size of recognised entries, `None` until the next rescan.
    pub fn size(&self) -> Option<u64> {
        self.index.size()
    }

    pub fn count(&self) -> Option<usize> {
        self.index.count()
    }

    /// Rescan the disk now if the totals are uninitialised.
    pub async fn ensure_size(&self) -> Option<u64> {
        if self.index.size().is_none() {
            let _guard = self.eviction_lock.lock().await;
            if self.index.size().is_none() {
                self.evictor.rescan(&self.index).await;
            }
        }
        self.index.size()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            indexed_entries: self.index.len(),
            total_size: self.index.size(),
            entry_count: self.index.count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DiskTrimmable for DiskBlobCache {
    async fn trim(&self, level: TrimLevel) {
        match level {
            TrimLevel::Minimum => {
                let _guard = self.eviction_lock.lock().await;
                if self.needs_rescan() {
                    self.evictor.rescan(&self.index).await;
                }
                if self.above(self.params.low_watermark) {
                    let outcome = self
                        .evictor
                        .evict_to(&self.index, self.params.low_watermark)
                        .await;
                    self.report_eviction(EvictionReason::CacheManagerTrimmed, outcome);
                }
            }
            TrimLevel::Nothing => self.clear_all().await,
        }
    }
}
