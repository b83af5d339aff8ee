//! Cache parameters and environment-based configuration

use crate::error::{CacheError, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LOW_WATERMARK: u64 = 900 * 1024 * 1024; // 900 MiB
const DEFAULT_HIGH_WATERMARK: u64 = 1024 * 1024 * 1024; // 1 GiB
const DEFAULT_SIZE_REFRESH: Duration = Duration::from_secs(30 * 60);

/// Parameters fixed for the lifetime of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheParams {
    /// Isolates the on-disk namespace; bumping it orphans older data.
    pub schema_version: u32,
    /// Eviction shrinks the cache to this size.
    pub low_watermark: u64,
    /// Eviction starts once the cache is larger than this.
    pub high_watermark: u64,
    /// How stale the size total may get before an insert rescans the disk.
    pub size_refresh_interval: Duration,
}

impl CacheParams {
    pub fn new(schema_version: u32, low_watermark: u64, high_watermark: u64) -> Result<Self> {
        let params = Self {
            schema_version,
            low_watermark,
            high_watermark,
            size_refresh_interval: DEFAULT_SIZE_REFRESH,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_size_refresh_interval(mut self, interval: Duration) -> Self {
        self.size_refresh_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.low_watermark > self.high_watermark {
            return Err(CacheError::Config(format!(
                "low watermark ({} bytes) is above high watermark ({} bytes)",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            schema_version: 1,
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            size_refresh_interval: DEFAULT_SIZE_REFRESH,
        }
    }
}

/// Configuration for a file-backed cache, usually read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub schema_version: u32,
    pub low_watermark: u64,
    pub high_watermark: u64,
    pub size_refresh_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let params = CacheParams::default();
        Self {
            cache_dir: PathBuf::from("./cache/blobs"),
            schema_version: params.schema_version,
            low_watermark: params.low_watermark,
            high_watermark: params.high_watermark,
            size_refresh_secs: params.size_refresh_interval.as_secs(),
        }
    }
}

impl CacheConfig {
    /// Parse configuration from environment variables.
    ///
    /// Unset variables fall back to defaults; set but unparsable ones are an
    /// error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        Ok(Self {
            cache_dir,
            schema_version: parse_var(&lookup, "CACHE_SCHEMA_VERSION", defaults.schema_version)?,
            low_watermark: parse_var(&lookup, "CACHE_LOW_WATERMARK", defaults.low_watermark)?,
            high_watermark: parse_var(&lookup, "CACHE_HIGH_WATERMARK", defaults.high_watermark)?,
            size_refresh_secs: parse_var(
                &lookup,
                "CACHE_SIZE_REFRESH_SECS",
                defaults.size_refresh_secs,
            )?,
        })
    }

    /// Validated coordinator parameters.
    pub fn params(&self) -> Result<CacheParams> {
        Ok(
            CacheParams::new(self.schema_version, self.low_watermark, self.high_watermark)?
                .with_size_refresh_interval(Duration::from_secs(self.size_refresh_secs)),
        )
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CacheError::Config(format!("{} has an invalid value: {:?}", name, raw))),
        None => Ok(default),
    }
}
