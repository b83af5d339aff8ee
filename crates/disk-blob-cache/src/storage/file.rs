//! File-system storage backend
//!
//! # Directory Structure
//! ```text
//! root/
//! └── v1/                                  # one namespace per schema version
//!     ├── 3f/
//!     │   ├── 3fa2...c1.blob               # committed entry
//!     │   └── 3fa2...c1.<uuid>.tmp         # write in progress
//!     └── stray.log                        # foreign file
//! ```

use super::{BlobResource, CommittedWrite, ForeignFile, PendingWrite, Storage, StorageEntry, StorageItem};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};
use crate::events::{CacheErrorCategory, CacheErrorLogger, TracingErrorLogger};
use crate::key::ResourceId;
use crate::writer::BlobSink;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;
use uuid::Uuid;

const ENTRY_SUFFIX: &str = ".blob";
const TEMP_SUFFIX: &str = ".tmp";

/// Temp files younger than this may belong to a writer in another instance.
const TEMP_FILE_LIFETIME: Duration = Duration::from_secs(30 * 60);

type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

/// Stores each entry as a flat file inside a per-version namespace directory.
pub struct FileStorage {
    root: PathBuf,
    version: u32,
    namespace: PathBuf,
    clock: Arc<dyn Clock>,
    error_logger: Arc<dyn CacheErrorLogger>,
    in_flight: InFlight,
}

impl FileStorage {
    /// Create a backend rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>, version: u32) -> Self {
        let root: PathBuf = root.into();
        let namespace = root.join(format!("v{}", version));
        Self {
            root,
            version,
            namespace,
            clock: Arc::new(SystemClock),
            error_logger: Arc::new(TracingErrorLogger),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Use `clock` for commit and touch timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_error_logger(mut self, error_logger: Arc<dyn CacheErrorLogger>) -> Self {
        self.error_logger = error_logger;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every item of this schema version.
    pub fn namespace_dir(&self) -> &Path {
        &self.namespace
    }

    fn entry_path(&self, id: &ResourceId) -> PathBuf {
        self.namespace
            .join(id.shard())
            .join(format!("{}{}", id, ENTRY_SUFFIX))
    }

    /// Parse a path back into the id it was written under.
    fn recognize(&self, path: &Path) -> Option<ResourceId> {
        let file_name = path.file_name()?.to_str()?;
        let id = ResourceId::parse(file_name.strip_suffix(ENTRY_SUFFIX)?)?;
        (path.parent()? == self.namespace.join(id.shard())).then_some(id)
    }

    /// Temp files that must not be reported or deleted.
    fn is_live_temp(&self, path: &Path, metadata: &Metadata, in_flight: &HashSet<PathBuf>) -> bool {
        let is_temp = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(TEMP_SUFFIX))
            .unwrap_or(false);
        if !is_temp {
            return false;
        }
        if in_flight.contains(path) {
            return true;
        }
        metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age < TEMP_FILE_LIFETIME)
            .unwrap_or(true)
    }

    fn in_flight_snapshot(&self) -> HashSet<PathBuf> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every non-directory under the namespace, skipping live temp files,
    /// plus the directories visited (deepest last).
    async fn walk(&self) -> io::Result<(Vec<(PathBuf, Metadata)>, Vec<PathBuf>)> {
        let in_flight = self.in_flight_snapshot();
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut pending = vec![self.namespace.clone()];

        while let Some(dir) = pending.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            while let Some(dir_entry) = reader.next_entry().await? {
                let path = dir_entry.path();
                let metadata = match dir_entry.metadata().await {
                    Ok(metadata) => metadata,
                    // Deleted between listing and stat
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };

                if metadata.is_dir() {
                    pending.push(path.clone());
                    dirs.push(path);
                } else if !self.is_live_temp(&path, &metadata, &in_flight) {
                    files.push((path, metadata));
                }
            }
        }

        Ok((files, dirs))
    }
}

fn modified_at(metadata: &Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

async fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn join_blocking<T: Send + 'static>(
    task: impl FnOnce() -> io::Result<T> + Send + 'static,
) -> io::Result<T> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(io::Error::other)?
}

#[async_trait]
impl Storage for FileStorage {
    fn version(&self) -> u32 {
        self.version
    }

    /// Directories are created on first write, so the nearest existing
    /// ancestor of the namespace decides.
    fn is_enabled(&self) -> bool {
        self.namespace
            .ancestors()
            .find(|dir| dir.exists())
            .is_some_and(Path::is_dir)
    }

    async fn touch(&self, id: &ResourceId) -> Result<bool> {
        let path = self.entry_path(id);
        let now = SystemTime::from(self.clock.now());
        let touched = join_blocking(move || {
            match std::fs::OpenOptions::new().write(true).open(&path) {
                Ok(file) => file.set_modified(now).map(|_| true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await?;
        Ok(touched)
    }

    async fn resource(&self, id: &ResourceId) -> Result<Option<BlobResource>> {
        let path = self.entry_path(id);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                Ok(Some(BlobResource::new(path, metadata.len())))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn begin_write(&self, id: &ResourceId) -> Result<Box<dyn PendingWrite>> {
        let final_path = self.entry_path(id);
        let shard_dir = self.namespace.join(id.shard());
        fs::create_dir_all(&shard_dir).await?;

        let temp_path = shard_dir.join(format!(
            "{}.{}{}",
            id,
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));
        let file = fs::File::create(&temp_path).await?;
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(temp_path.clone());

        debug!(resource_id = %id, temp_path = ?temp_path, "Started staged write");
        Ok(Box::new(FilePendingWrite {
            temp_path,
            final_path,
            writer: Some(BufWriter::new(file)),
            discard: tokio::io::sink(),
            clock: self.clock.clone(),
            error_logger: self.error_logger.clone(),
            in_flight: self.in_flight.clone(),
        }))
    }

    async fn entries(&self) -> Result<Vec<StorageItem>> {
        let (files, _) = self.walk().await?;
        let items = files
            .into_iter()
            .map(|(path, metadata)| {
                let size = metadata.len();
                let timestamp = modified_at(&metadata);
                match self.recognize(&path) {
                    Some(id) => StorageItem::Recognized(StorageEntry {
                        id,
                        path,
                        size,
                        timestamp,
                    }),
                    None => StorageItem::Unrecognized(ForeignFile {
                        path,
                        size,
                        timestamp,
                    }),
                }
            })
            .collect();
        Ok(items)
    }

    async fn remove(&self, item: &StorageItem) -> Result<u64> {
        let removed = remove_if_present(item.path()).await?;
        Ok(if removed { item.size() } else { 0 })
    }

    async fn remove_resource(&self, id: &ResourceId) -> Result<u64> {
        let path = self.entry_path(id);
        let size = match fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let removed = remove_if_present(&path).await?;
        Ok(if removed { size } else { 0 })
    }

    async fn clear_all(&self) -> Result<()> {
        let (files, mut dirs) = self.walk().await?;
        for (path, _) in files {
            remove_if_present(&path).await?;
        }

        // Children were pushed after their parents
        dirs.reverse();
        for dir in dirs {
            // Still holds an in-flight write
            let _ = fs::remove_dir(&dir).await;
        }
        Ok(())
    }
}

struct FilePendingWrite {
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<fs::File>>,
    /// Handed out by `sink` once the write is finished.
    discard: tokio::io::Sink,
    clock: Arc<dyn Clock>,
    error_logger: Arc<dyn CacheErrorLogger>,
    in_flight: InFlight,
}

impl FilePendingWrite {
    fn release(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.temp_path);
    }

    async fn discard_temp(&self) {
        if let Err(e) = remove_if_present(&self.temp_path).await {
            self.error_logger.log_error(
                CacheErrorCategory::DeleteFile,
                "removing staged write",
                &e,
            );
        }
        self.release();
    }

    /// Flush, stamp and size the staged file, then close it.
    async fn seal(&self, mut writer: BufWriter<fs::File>) -> io::Result<u64> {
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;

        let file = file.into_std().await;
        let stamped_at = SystemTime::from(self.clock.now());
        join_blocking(move || {
            file.set_modified(stamped_at)?;
            Ok(file.metadata()?.len())
        })
        .await
    }
}

fn already_finished() -> CacheError {
    CacheError::Io(Box::new(io::Error::other("staged write already finished")))
}

#[async_trait]
impl PendingWrite for FilePendingWrite {
    fn sink(&mut self) -> &mut BlobSink {
        match self.writer.as_mut() {
            Some(writer) => writer as &mut BlobSink,
            None => &mut self.discard as &mut BlobSink,
        }
    }

    async fn commit(&mut self) -> Result<CommittedWrite> {
        let writer = self.writer.take().ok_or_else(already_finished)?;

        let size = match self.seal(writer).await {
            Ok(size) => size,
            Err(e) => {
                self.discard_temp().await;
                return Err(e.into());
            }
        };

        let replaced = match fs::metadata(&self.final_path).await {
            Ok(metadata) if metadata.is_file() => Some(metadata.len()),
            _ => None,
        };

        if let Err(e) = fs::rename(&self.temp_path, &self.final_path).await {
            self.error_logger
                .log_error(CacheErrorCategory::WriteCommit, "publishing staged write", &e);
            self.discard_temp().await;
            return Err(e.into());
        }
        self.release();

        debug!(path = ?self.final_path, size, ?replaced, "Committed entry");
        Ok(CommittedWrite {
            resource: BlobResource::new(self.final_path.clone(), size),
            replaced,
        })
    }

    async fn abort(&mut self) -> Result<()> {
        let writer = self.writer.take().ok_or_else(already_finished)?;
        drop(writer);

        let result = remove_if_present(&self.temp_path).await;
        self.release();
        result?;
        Ok(())
    }
}

impl Drop for FilePendingWrite {
    fn drop(&mut self) {
        // Dropped mid-write, e.g. the insert future was cancelled
        if self.writer.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn storage_with_clock(root: &Path, version: u32) -> (FileStorage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(HOUR));
        let storage = FileStorage::new(root, version).with_clock(clock.clone());
        (storage, clock)
    }

    async fn write_entry(storage: &FileStorage, candidate: &str, data: &[u8]) -> BlobResource {
        let id = storage.resolve(candidate);
        let mut pending = storage.begin_write(&id).await.unwrap();
        pending.sink().write_all(data).await.unwrap();
        pending.commit().await.unwrap().resource
    }

    async fn exists(storage: &FileStorage, candidate: &str) -> bool {
        let id = storage.resolve(candidate);
        storage.resource(&id).await.unwrap().is_some()
    }

    #[test]
    fn test_namespace_per_version() {
        let dir = tempdir().unwrap();
        let v1 = FileStorage::new(dir.path(), 1);
        let v2 = FileStorage::new(dir.path(), 2);

        assert_ne!(v1.namespace_dir(), v2.namespace_dir());
        assert_ne!(v1.resolve("same"), v2.resolve("same"));
        assert_eq!(v1.resolve("same"), v1.resolve("same"));
    }

    #[tokio::test]
    async fn test_commit_publishes_entry() {
        let dir = tempdir().unwrap();
        let (storage, clock) = storage_with_clock(dir.path(), 1);

        let resource = write_entry(&storage, "foo", b"hello world").await;
        let id = storage.resolve("foo");

        assert_eq!(resource.size(), 11);
        assert_eq!(resource.read().await.unwrap(), b"hello world");
        assert!(storage.resource(&id).await.unwrap().is_some());
        assert_eq!(storage.resource(&id).await.unwrap(), Some(resource));

        let items = storage.entries().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource_id(), Some(&id));
        assert_eq!(items[0].timestamp(), clock.now());
    }

    #[tokio::test]
    async fn test_staged_write_is_invisible() {
        let dir = tempdir().unwrap();
        let (storage, _clock) = storage_with_clock(dir.path(), 1);
        let id = storage.resolve("pending");

        let mut pending = storage.begin_write(&id).await.unwrap();
        pending.sink().write_all(b"partial").await.unwrap();

        assert!(storage.resource(&id).await.unwrap().is_none());
        assert!(storage.resource(&id).await.unwrap().is_none());
        assert!(storage.entries().await.unwrap().is_empty());

        pending.commit().await.unwrap();
        assert!(storage.resource(&id).await.unwrap().is_some());
        assert!(pending.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let (storage, _clock) = storage_with_clock(dir.path(), 1);
        let id = storage.resolve("aborted");

        let mut pending = storage.begin_write(&id).await.unwrap();
        pending.sink().write_all(b"junk").await.unwrap();
        pending.abort().await.unwrap();

        assert!(storage.resource(&id).await.unwrap().is_none());
        let shard = storage.namespace_dir().join(id.shard());
        let mut reader = fs::read_dir(&shard).await.unwrap();
        assert!(reader.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_write_is_cleaned_up() {
        let dir = tempdir().unwrap();
        let (storage, _clock) = storage_with_clock(dir.path(), 1);
        let id = storage.resolve("dropped");

        let pending = storage.begin_write(&id).await.unwrap();
        drop(pending);

        let shard = storage.namespace_dir().join(id.shard());
        let mut reader = fs::read_dir(&shard).await.unwrap();
        assert!(reader.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_files_are_unrecognized() {
        let dir = tempdir().unwrap();
        let (storage, _clock) = storage_with_clock(dir.path(), 1);
        write_entry(&storage, "foo", b"abc").await;

        std::fs::write(storage.namespace_dir().join("unexpected1"), vec![0u8; 110]).unwrap();
        let misplaced = storage.namespace_dir().join("zz");
        std::fs::create_dir_all(&misplaced).unwrap();
        let id = storage.resolve("elsewhere");
        std::fs::write(misplaced.join(format!("{}.blob", id)), b"x").unwrap();

        let items = storage.entries().await.unwrap();
        let recognized = items.iter().filter(|i| i.resource_id().is_some()).count();
        let foreign: Vec<&StorageItem> =
            items.iter().filter(|i| i.resource_id().is_none()).collect();

        assert_eq!(recognized, 1);
        assert_eq!(foreign.len(), 2);
        assert!(foreign.iter().any(|i| i.size() == 110));
    }

    #[tokio::test]
    async fn test_stale_temp_file_is_foreign() {
        let dir = tempdir().unwrap();
        let (storage, _clock) = storage_with_clock(dir.path(), 1);
        std::fs::create_dir_all(storage.namespace_dir()).unwrap();

        let fresh = storage.namespace_dir().join("abc.fresh.tmp");
        let stale = storage.namespace_dir().join("abc.stale.tmp");
        std::fs::write(&fresh, b"1").unwrap();
        std::fs::write(&stale, b"2").unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&stale).unwrap();
        file.set_modified(SystemTime::now() - 2 * TEMP_FILE_LIFETIME)
            .unwrap();

        let items = storage.entries().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path(), stale.as_path());
    }

    #[tokio::test]
    async fn test_touch_refreshes_timestamp() {
        let dir = tempdir().unwrap();
        let (storage, clock) = storage_with_clock(dir.path(), 1);
        write_entry(&storage, "foo", b"abc").await;
        let id = storage.resolve("foo");

        clock.advance(HOUR);
        assert!(storage.touch(&id).await.unwrap());
        assert!(!storage.touch(&storage.resolve("missing")).await.unwrap());

        let items = storage.entries().await.unwrap();
        assert_eq!(items[0].timestamp(), clock.now());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempdir().unwrap();
        let (storage, _clock) = storage_with_clock(dir.path(), 1);
        write_entry(&storage, "one", b"12345").await;
        write_entry(&storage, "two", b"123").await;

        assert_eq!(storage.remove_resource(&storage.resolve("one")).await.unwrap(), 5);
        assert_eq!(storage.remove_resource(&storage.resolve("one")).await.unwrap(), 0);

        std::fs::write(storage.namespace_dir().join("stray"), b"x").unwrap();
        storage.clear_all().await.unwrap();

        assert!(storage.entries().await.unwrap().is_empty());
        assert!(!exists(&storage, "two").await);
    }

    #[tokio::test]
    async fn test_other_versions_untouched() {
        let dir = tempdir().unwrap();
        let (v1, _clock) = storage_with_clock(dir.path(), 1);
        let (v2, _clock) = storage_with_clock(dir.path(), 2);
        write_entry(&v1, "shared", b"v1").await;
        write_entry(&v2, "shared", b"v2").await;

        assert_eq!(v2.entries().await.unwrap().len(), 1);
        v2.clear_all().await.unwrap();

        let id = v1.resolve("shared");
        let resource = v1.resource(&id).await.unwrap().unwrap();
        assert_eq!(resource.read().await.unwrap(), b"v1");
    }

    #[test]
    fn test_enabled_tracks_root_availability() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let storage = FileStorage::new(&root, 1);
        assert!(storage.is_enabled());
        // Checking does not create anything
        assert!(!root.exists());

        std::fs::write(&root, b"not a directory").unwrap();
        assert!(!storage.is_enabled());

        std::fs::remove_file(&root).unwrap();
        std::fs::create_dir_all(storage.namespace_dir()).unwrap();
        assert!(storage.is_enabled());
    }

    #[tokio::test]
    async fn test_commit_reports_replaced_entry() {
        let dir = tempdir().unwrap();
        let (storage, _clock) = storage_with_clock(dir.path(), 1);
        let id = storage.resolve("foo");

        let mut first = storage.begin_write(&id).await.unwrap();
        first.sink().write_all(&[1u8; 100]).await.unwrap();
        assert_eq!(first.commit().await.unwrap().replaced, None);

        let mut second = storage.begin_write(&id).await.unwrap();
        second.sink().write_all(&[2u8; 40]).await.unwrap();
        let committed = second.commit().await.unwrap();
        assert_eq!(committed.replaced, Some(100));
        assert_eq!(committed.resource.size(), 40);
        assert!(exists(&storage, "foo").await);
    }
}
