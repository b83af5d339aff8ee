//! Disk cache admin - maintenance commands for an on-disk blob cache
//!
//! Reads the cache location and limits from the same environment variables
//! as the services that embed the cache, then runs a single command.

mod command;
mod error;

use crate::command::{execute, Cli};
use crate::error::Result;
use clap::Parser;
use disk_blob_cache::{CacheConfig, DiskBlobCache};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("disk_cache_admin=info".parse()?)
        .add_directive("disk_blob_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let config = CacheConfig::from_env()?;
    info!("Cache dir: {:?}", config.cache_dir);
    info!("Schema version: {}", config.schema_version);
    info!(
        "Watermarks: {} MB / {} MB",
        config.low_watermark / (1024 * 1024),
        config.high_watermark / (1024 * 1024)
    );

    let cache = DiskBlobCache::from_config(&config)?;
    if !cache.is_enabled() {
        return Err(disk_blob_cache::CacheError::Disabled.into());
    }

    let output = execute(&cache, cli.command).await?;
    println!("{}", output);

    Ok(())
}
