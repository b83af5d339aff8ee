//! Cache types

use serde::{Deserialize, Serialize};

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held in the in-memory index
    pub indexed_entries: usize,
    /// Aggregate size of recognised entries, `None` until the next rescan
    pub total_size: Option<u64>,
    pub entry_count: Option<usize>,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.indexed_entries, 0);
        assert_eq!(stats.total_size, None);
        assert_eq!(stats.entry_count, None);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_cache_stats_serialization() {
        let stats = CacheStats {
            indexed_entries: 2,
            total_size: Some(12345),
            entry_count: Some(3),
            hits: 7,
            misses: 1,
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"total_size\":12345"));

        let uninitialized = serde_json::to_string(&CacheStats::default()).unwrap();
        assert!(uninitialized.contains("\"total_size\":null"));

        let deserialized: CacheStats = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, stats);
    }
}
