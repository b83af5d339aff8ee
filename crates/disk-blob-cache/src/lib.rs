//! Versioned on-disk blob cache with watermark and age-based eviction
//!
//! Entries are written through a caller-supplied [`WriterCallback`] into a
//! staged location and become visible only on an atomic commit. An in-memory
//! index shadows what is on disk and heals itself on every authoritative
//! lookup. The cache shrinks back to its low watermark before an insert once
//! it has grown past the high watermark, and purges stale items on request.

mod cache;
mod clock;
mod config;
mod error;
mod events;
mod eviction;
mod index;
mod key;
pub mod storage;
mod trim;
mod types;
mod writer;

pub use cache::{DiskBlobCache, DiskBlobCacheBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, CacheParams};
pub use error::{CacheError, Result};
pub use events::{
    CacheErrorCategory, CacheErrorLogger, CacheEventListener, EvictionReason,
    NoOpCacheEventListener, TracingErrorLogger,
};
pub use eviction::{EvictionOrder, EvictionOutcome, OldestFirst, ScoreBased};
pub use key::{CacheKey, ResourceId};
pub use storage::{BlobResource, CommittedWrite, FileStorage, Storage, StorageItem};
pub use trim::{DiskTrimmable, InProcessTrimRegistry, NoOpTrimRegistry, TrimLevel, TrimRegistry};
pub use types::CacheStats;
pub use writer::{BlobSink, WriterCallback};
