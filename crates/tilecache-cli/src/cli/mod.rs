//! CLI for the tilecache tile downloader.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tilecache_core::config;

use commands::{run_cache_clear, run_cache_status, run_cache_trim, run_fetch, FetchArgs};

/// Top-level CLI for tilecache.
#[derive(Debug, Parser)]
#[command(name = "tilecache")]
#[command(about = "tilecache: map tile downloader with a size-limited disk cache", long_about = None)]
pub struct Cli {
    /// Config file to use instead of ~/.config/tilecache/config.toml.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Cache root to use instead of the configured one.
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download tiles into the cache.
    Fetch {
        /// Tile URLs to download.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Cache-relative destination for each URL, in order (default: the URL path).
        #[arg(long = "dest", value_name = "NAME")]
        destinations: Vec<String>,

        /// Use the bulk download policy instead of the browse one.
        #[arg(long)]
        bulk: bool,

        /// Initiator identifier attached to the requests.
        #[arg(long, default_value = "cli", value_name = "ID")]
        id: String,
    },

    /// Inspect or maintain the tile cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show cache size and limits.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete every evictable tile (base levels are kept).
    Clear,

    /// Evict the oldest tiles until the cache is within its limit.
    Trim {
        /// Hard limit in bytes (default: configured limit).
        #[arg(long, value_name = "BYTES")]
        limit: Option<u64>,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let mut cfg = match &cli.config {
            Some(path) => config::load_or_init_at(path)?,
            None => config::load_or_init()?,
        };
        if let Some(dir) = cli.cache_dir {
            cfg.cache.data_dir = Some(dir);
        }
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Fetch {
                urls,
                destinations,
                bulk,
                id,
            } => {
                let args = FetchArgs {
                    urls,
                    destinations,
                    bulk,
                    initiator_id: id,
                };
                run_fetch(&cfg, args).await?
            }
            CliCommand::Cache { action } => match action {
                CacheCommand::Status { json } => run_cache_status(&cfg, json).await?,
                CacheCommand::Clear => run_cache_clear(&cfg).await?,
                CacheCommand::Trim { limit } => run_cache_trim(&cfg, limit).await?,
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
