//! Storage backend contract consumed by the cache coordinator
//!
//! A backend owns the byte-level I/O: it resolves candidate identifiers to
//! resource ids, stages writes in a hidden location until they are committed,
//! and enumerates everything it finds under its namespace, including files it
//! does not recognise.

mod file;

pub use file::FileStorage;

use crate::error::Result;
use crate::key::ResourceId;
use crate::writer::BlobSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// A committed, readable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobResource {
    path: PathBuf,
    size: u64,
}

impl BlobResource {
    pub fn new(path: PathBuf, size: u64) -> Self {
        Self { path, size }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the whole artifact into memory.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

/// Outcome of publishing a staged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedWrite {
    pub resource: BlobResource,
    /// Size of the entry the commit replaced, if one was already on disk.
    pub replaced: Option<u64>,
}

/// An entry written through the backend's naming convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub id: ResourceId,
    pub path: PathBuf,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// A file under the namespace that the backend did not write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignFile {
    pub path: PathBuf,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// One physical item found by [`Storage::entries`].
///
/// Both variants are ordered and deleted alike during eviction; only
/// recognised entries count towards the cache size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageItem {
    Recognized(StorageEntry),
    Unrecognized(ForeignFile),
}

impl StorageItem {
    pub fn path(&self) -> &Path {
        match self {
            StorageItem::Recognized(entry) => &entry.path,
            StorageItem::Unrecognized(file) => &file.path,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            StorageItem::Recognized(entry) => entry.size,
            StorageItem::Unrecognized(file) => file.size,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StorageItem::Recognized(entry) => entry.timestamp,
            StorageItem::Unrecognized(file) => file.timestamp,
        }
    }

    pub fn resource_id(&self) -> Option<&ResourceId> {
        match self {
            StorageItem::Recognized(entry) => Some(&entry.id),
            StorageItem::Unrecognized(_) => None,
        }
    }
}

/// A write staged in a location readers cannot see.
///
/// Exactly one of [`commit`](PendingWrite::commit) or
/// [`abort`](PendingWrite::abort) must be called; either one finishes the
/// write and later calls fail.
#[async_trait]
pub trait PendingWrite: Send {
    fn sink(&mut self) -> &mut BlobSink;

    /// Atomically publish the staged bytes under the final resource id.
    async fn commit(&mut self) -> Result<CommittedWrite>;

    /// Delete the staged bytes.
    async fn abort(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn version(&self) -> u32;

    /// Live availability check. Not cached by callers.
    fn is_enabled(&self) -> bool;

    /// Resource id for a candidate identifier under this backend's version.
    fn resolve(&self, candidate: &str) -> ResourceId {
        ResourceId::derive(candidate, self.version())
    }

    /// Refresh the entry's timestamp. Returns false if it does not exist.
    async fn touch(&self, id: &ResourceId) -> Result<bool>;

    async fn resource(&self, id: &ResourceId) -> Result<Option<BlobResource>>;

    async fn begin_write(&self, id: &ResourceId) -> Result<Box<dyn PendingWrite>>;

    /// Every item under the namespace, recognised or not.
    async fn entries(&self) -> Result<Vec<StorageItem>>;

    /// Delete one enumerated item. Returns the bytes freed, 0 if it was
    /// already gone.
    async fn remove(&self, item: &StorageItem) -> Result<u64>;

    /// Delete the entry for `id`. Returns the bytes freed, 0 if absent.
    async fn remove_resource(&self, id: &ResourceId) -> Result<u64>;

    async fn clear_all(&self) -> Result<()>;
}
