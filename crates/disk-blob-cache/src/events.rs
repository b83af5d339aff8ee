//! Lifecycle notifications and the non-fatal error sink

use serde::Serialize;
use std::fmt;
use tracing::warn;

/// Why a batch of entries left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Aggregate size went above the high watermark.
    CacheFull,
    /// Entries were older than the requested maximum age.
    ContentStale,
    /// An external low-disk-space trim.
    CacheManagerTrimmed,
    /// The caller removed a key explicitly.
    UserForced,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionReason::CacheFull => "cache_full",
            EvictionReason::ContentStale => "content_stale",
            EvictionReason::CacheManagerTrimmed => "cache_manager_trimmed",
            EvictionReason::UserForced => "user_forced",
        };
        f.write_str(name)
    }
}

/// Receives cache lifecycle events. Every method defaults to a no-op.
pub trait CacheEventListener: Send + Sync {
    fn on_write_attempt(&self) {}

    fn on_write_success(&self, _size: u64) {}

    fn on_write_failure(&self) {}

    fn on_hit(&self) {}

    fn on_miss(&self) {}

    fn on_read_failure(&self) {}

    fn on_eviction(&self, _reason: EvictionReason, _entry_count: usize, _total_bytes: u64) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCacheEventListener;

impl CacheEventListener for NoOpCacheEventListener {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheErrorCategory {
    ReadFile,
    WriteCreateTempFile,
    WriteCallback,
    WriteCommit,
    DeleteFile,
    Eviction,
    Enumerate,
    GenericIo,
}

/// Sink for storage failures that are recovered from rather than returned.
///
/// Implementations must not panic.
pub trait CacheErrorLogger: Send + Sync {
    fn log_error(
        &self,
        category: CacheErrorCategory,
        context: &str,
        error: &(dyn std::error::Error + 'static),
    );
}

/// Forwards recovered errors to `tracing` at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorLogger;

impl CacheErrorLogger for TracingErrorLogger {
    fn log_error(
        &self,
        category: CacheErrorCategory,
        context: &str,
        error: &(dyn std::error::Error + 'static),
    ) {
        warn!(category = ?category, context, error = %error, "Disk cache operation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CacheEventListener for Recorder {
        fn on_hit(&self) {
            self.events.lock().unwrap().push("hit".to_string());
        }

        fn on_eviction(&self, reason: EvictionReason, entry_count: usize, total_bytes: u64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", reason, entry_count, total_bytes));
        }
    }

    #[test]
    fn test_listener_defaults_are_noops() {
        let recorder = Recorder::default();
        recorder.on_write_attempt();
        recorder.on_miss();
        recorder.on_hit();
        recorder.on_eviction(EvictionReason::ContentStale, 2, 83);

        let events = recorder.events.lock().unwrap();
        assert_eq!(*events, vec!["hit", "content_stale:2:83"]);
    }

    #[test]
    fn test_eviction_reason_serialization() {
        let json = serde_json::to_string(&EvictionReason::CacheFull).unwrap();
        assert_eq!(json, "\"cache_full\"");
        assert_ne!(EvictionReason::CacheFull, EvictionReason::ContentStale);
    }

    #[test]
    fn test_tracing_logger_never_panics() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "read-only volume");
        TracingErrorLogger.log_error(CacheErrorCategory::DeleteFile, "evicting entry", &err);
    }
}
