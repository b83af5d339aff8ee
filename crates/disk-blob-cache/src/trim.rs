//! Hooks for shrinking caches under external low-disk-space pressure

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimLevel {
    /// Shrink to the configured floor.
    Minimum,
    /// Drop everything.
    Nothing,
}

/// Something that can give disk space back on request.
#[async_trait]
pub trait DiskTrimmable: Send + Sync {
    async fn trim(&self, level: TrimLevel);
}

/// Where trimmables register themselves at construction.
///
/// Registries hold weak handles so a registered cache can still be dropped.
pub trait TrimRegistry: Send + Sync {
    fn register(&self, trimmable: Weak<dyn DiskTrimmable>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTrimRegistry;

impl TrimRegistry for NoOpTrimRegistry {
    fn register(&self, _trimmable: Weak<dyn DiskTrimmable>) {}
}

/// Keeps registered trimmables and fans a trim request out to all live ones.
#[derive(Default)]
pub struct InProcessTrimRegistry {
    trimmables: Mutex<Vec<Weak<dyn DiskTrimmable>>>,
}

impl InProcessTrimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registrations still alive.
    pub fn live_count(&self) -> usize {
        self.trimmables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// Trim every live registration. Returns how many were trimmed.
    pub async fn trim_all(&self, level: TrimLevel) -> usize {
        let live: Vec<_> = {
            let mut trimmables = self
                .trimmables
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            trimmables.retain(|t| t.strong_count() > 0);
            trimmables.iter().filter_map(Weak::upgrade).collect()
        };

        for trimmable in &live {
            trimmable.trim(level).await;
        }
        live.len()
    }
}

impl TrimRegistry for InProcessTrimRegistry {
    fn register(&self, trimmable: Weak<dyn DiskTrimmable>) {
        self.trimmables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trimmable);
    }
}
