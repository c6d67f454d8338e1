//! Sectorcast
//!
//! Uploads a local file through the segment upload engine to a set of
//! in-memory storage hosts and prints the engine statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            sectorcast                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  File Store  │───▶│    Upload    │───▶│ Memory Hosts │       │
//! │  │  (metadata)  │    │   Manager    │    │  (sectors)   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sectorcast::adapters::{HostDownloader, MemoryFileStore, MemoryHost};
use sectorcast::{StoragePath, UploadConfig, UploadManager};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Sectorcast - erasure-coded segment upload engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local file to upload
    file: PathBuf,

    /// Number of storage hosts to spread sectors across
    #[arg(long, env = "SECTORCAST_HOSTS", default_value = "10")]
    hosts: usize,

    /// Sectors needed to recover a segment
    #[arg(long, env = "SECTORCAST_MIN_SECTORS", default_value = "10")]
    min_sectors: usize,

    /// Sectors produced per segment
    #[arg(long, env = "SECTORCAST_TOTAL_SECTORS", default_value = "30")]
    total_sectors: usize,

    /// Sector size in bytes
    #[arg(long, env = "SECTORCAST_SECTOR_SIZE", default_value = "65536")]
    sector_size: u64,

    /// Memory ceiling for in-flight segments in bytes
    #[arg(long, env = "SECTORCAST_MEMORY_LIMIT")]
    memory_limit: Option<u64>,

    /// JSON configuration file
    #[arg(long, env = "SECTORCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => UploadConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => UploadConfig::default(),
    };
    if let Some(limit) = args.memory_limit {
        config.memory_limit_bytes = limit;
    }

    let file_size = tokio::fs::metadata(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?
        .len();

    info!("Starting sectorcast");
    info!("  File: {} ({} bytes)", args.file.display(), file_size);
    info!("  Hosts: {}", args.hosts);
    info!(
        "  Erasure coding: {}-of-{}, {} byte sectors",
        args.min_sectors, args.total_sectors, args.sector_size
    );
    info!("  Memory limit: {} bytes", config.memory_limit_bytes);

    let store = Arc::new(MemoryFileStore::new());
    let downloader = Arc::new(HostDownloader::new());
    let manager = UploadManager::new(config, store.clone(), downloader.clone())?;

    for i in 0..args.hosts {
        let host = MemoryHost::new(&format!("host-{i}"));
        downloader.register(host.clone());
        manager.add_host(host)?;
    }

    let name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let path = StoragePath::new(format!("uploads/{name}"));
    store.create_file(
        path.as_str(),
        file_size,
        args.sector_size,
        args.min_sectors,
        args.total_sectors,
        Some(args.file.clone()),
    )?;

    let runner = manager.start();
    let queued = manager.upload_file(&path, false).await?;
    info!(queued, "segments queued");
    manager.wait_idle().await;

    let entry = store
        .get(&path)
        .context("uploaded file vanished from the store")?;
    let stuck = entry.stuck_segments();
    if !stuck.is_empty() {
        warn!(?stuck, "segments left stuck");
    }

    manager.shutdown().await;
    if let Err(e) = runner.await {
        warn!(error = %e, "upload loop ended abnormally");
    }

    println!("{}", serde_json::to_string_pretty(&manager.stats())?);
    info!("Upload complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
