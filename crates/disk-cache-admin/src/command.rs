//! Command parsing and execution

use crate::error::Result;
use clap::{Parser, Subcommand, ValueEnum};
use disk_blob_cache::{DiskBlobCache, DiskTrimmable, TrimLevel};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "disk-cache-admin",
    version,
    about = "Maintenance commands for the on-disk blob cache"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Rescan if needed and print the cache statistics as JSON
    Stats,
    /// Delete everything in the current schema version
    Clear,
    /// Delete items older than the given age
    ClearOld { max_age_secs: u64 },
    /// Shrink the cache as under low disk space
    Trim {
        #[arg(value_enum, default_value_t = TrimTarget::Minimum)]
        level: TrimTarget,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimTarget {
    /// Evict down to the low watermark
    Minimum,
    /// Drop everything
    Nothing,
}

impl From<TrimTarget> for TrimLevel {
    fn from(target: TrimTarget) -> Self {
        match target {
            TrimTarget::Minimum => TrimLevel::Minimum,
            TrimTarget::Nothing => TrimLevel::Nothing,
        }
    }
}

/// Run a command and return what should be printed.
pub async fn execute(cache: &DiskBlobCache, command: Command) -> Result<String> {
    match command {
        Command::Stats => {
            cache.ensure_size().await;
            Ok(serde_json::to_string_pretty(&cache.stats())?)
        }
        Command::Clear => {
            cache.clear_all().await;
            Ok("cleared".to_string())
        }
        Command::ClearOld { max_age_secs } => {
            let max_age = Duration::from_secs(max_age_secs);
            let youngest = cache.clear_old_entries(max_age).await;
            info!(
                max_age_secs = max_age.as_secs(),
                youngest_remaining_secs = youngest.as_secs(),
                "Purged stale entries"
            );
            Ok(format!("youngest remaining entry: {}s", youngest.as_secs()))
        }
        Command::Trim { level } => {
            cache.trim(level.into()).await;
            Ok(format!("size after trim: {:?}", cache.size()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk_blob_cache::{CacheConfig, CacheKey};
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> std::result::Result<Command, clap::Error> {
        let argv = std::iter::once("disk-cache-admin").chain(args.iter().copied());
        Cli::try_parse_from(argv).map(|cli| cli.command)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse(&["stats"]).unwrap(), Command::Stats);
        assert_eq!(parse(&["clear"]).unwrap(), Command::Clear);
        assert_eq!(
            parse(&["clear-old", "3600"]).unwrap(),
            Command::ClearOld { max_age_secs: 3600 }
        );
        assert_eq!(
            parse(&["trim"]).unwrap(),
            Command::Trim {
                level: TrimTarget::Minimum
            }
        );
        assert_eq!(
            parse(&["trim", "nothing"]).unwrap(),
            Command::Trim {
                level: TrimTarget::Nothing
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["clear-old", "soon"]).is_err());
        assert!(parse(&["trim", "everything"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            cache_dir: dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        let cache = DiskBlobCache::from_config(&config).unwrap();
        cache
            .insert(&CacheKey::new("entry"), b"twelve bytes".as_slice())
            .await
            .unwrap();

        let output = execute(&cache, Command::Stats).await.unwrap();
        let stats: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(stats["total_size"], 12);
        assert_eq!(stats["entry_count"], 1);

        execute(&cache, Command::Clear).await.unwrap();
        let output = execute(&cache, Command::Stats).await.unwrap();
        let stats: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(stats["total_size"], 0);
    }
}
