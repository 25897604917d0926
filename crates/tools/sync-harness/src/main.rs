//! CLI harness for exercising a light server and the compact block cache
//!
//! Commands:
//! - `server-info`: print what the server reports and check it against the network
//! - `download`: fill a block cache from a start height to the tip
//! - `rewind-cache`: drop cached blocks above a height

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use zsdk_params::{BlockHeight, Network, NetworkType};
use zsdk_sync::download::DownloadBatch;
use zsdk_sync::retry::backoff_delay;
use zsdk_sync::{
    default_data_dir, BlockCacheStore, BlockRange, LightClient, LightClientConfig,
    RemoteChainService, SqliteBlockCache,
};

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Light wallet sync testing harness", long_about = None)]
struct Cli {
    /// Network to use
    #[arg(short, long, default_value = "mainnet", global = true)]
    network: NetworkType,

    /// Lightwalletd endpoint (defaults to the network's public server)
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print server metadata
    ServerInfo,

    /// Download compact blocks into a cache database
    Download {
        /// Cache database (defaults to <data dir>/<network>_harness_cache.db)
        #[arg(short, long)]
        cache: Option<PathBuf>,

        /// First height to fetch when the cache is empty
        #[arg(short, long)]
        start: u32,

        /// Last height to fetch (defaults to the chain tip)
        #[arg(short, long)]
        target: Option<u32>,

        /// Blocks per batch
        #[arg(short, long, default_value = "500")]
        batch_size: u32,

        /// Attempts per batch
        #[arg(long, default_value = "5")]
        retries: u32,
    },

    /// Drop cached blocks above a height
    RewindCache {
        /// Cache database (defaults to <data dir>/<network>_harness_cache.db)
        #[arg(short, long)]
        cache: Option<PathBuf>,

        /// Height to keep
        #[arg(long)]
        height: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let client_config = match &cli.endpoint {
        Some(endpoint) => LightClientConfig::new(endpoint, cli.network),
        None => LightClientConfig::for_network(cli.network),
    };

    match cli.command {
        Commands::ServerInfo => run_server_info(client_config).await,
        Commands::Download {
            cache,
            start,
            target,
            batch_size,
            retries,
        } => {
            let cache = cache.unwrap_or_else(|| default_cache_path(cli.network));
            run_download(client_config, cache, start, target, batch_size, retries).await
        }
        Commands::RewindCache { cache, height } => {
            let cache = cache.unwrap_or_else(|| default_cache_path(cli.network));
            run_rewind_cache(cli.network, cache, height).await
        }
    }
}

fn default_cache_path(network: NetworkType) -> PathBuf {
    default_data_dir().join(format!("{}_harness_cache.db", network))
}

async fn run_server_info(config: LightClientConfig) -> anyhow::Result<()> {
    let network = Network::from_type(config.network);
    let client = LightClient::with_config(config);
    info!("Endpoint: {}", client.endpoint());

    let server = client.server_info().await.context("server info request failed")?;
    println!("vendor:        {}", server.vendor);
    println!("version:       {}", server.version);
    println!("chain:         {}", server.chain_name);
    println!("branch id:     {}", server.consensus_branch_id);
    println!("block height:  {}", server.block_height);
    println!("estimated:     {}", server.estimated_height);
    println!("sapling at:    {}", server.sapling_activation_height);
    println!("taddr support: {}", server.taddr_support);

    if !network.matches_chain_name(&server.chain_name) {
        warn!(
            "Server chain '{}' does not match {}",
            server.chain_name, network.network_type
        );
    }
    Ok(())
}

async fn run_download(
    config: LightClientConfig,
    cache_path: PathBuf,
    start: u32,
    target: Option<u32>,
    batch_size: u32,
    retries: u32,
) -> anyhow::Result<()> {
    let network = config.network;
    let client = LightClient::with_config(config);
    let cache = SqliteBlockCache::open(&cache_path, network)
        .with_context(|| format!("opening cache {}", cache_path.display()))?;
    info!("Cache: {}", cache_path.display());

    let tip = client.latest_height().await.context("tip request failed")?;
    let end = match target {
        Some(target) => BlockHeight::new(target as u64, network)?.min(tip),
        None => tip,
    };
    let first = match cache.highest_height().await? {
        Some(highest) => highest.checked_add(1)?,
        None => BlockHeight::new(start as u64, network)?,
    };
    let Some(range) = BlockRange::new(first, end) else {
        info!("Cache already at {}, nothing to download", end);
        return Ok(());
    };
    info!("Downloading {} ({} blocks)", range, range.len());

    let pb = ProgressBar::new(range.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    let started = Instant::now();
    for mut batch in DownloadBatch::plan(range, batch_size.max(1)) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match batch.fetch(&client, &cache).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < retries => {
                    let delay = backoff_delay(Duration::from_millis(500), attempt, Duration::from_secs(30));
                    warn!("Batch {} failed ({}), retrying in {:?}", batch.range, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    pb.abandon_with_message("failed");
                    return Err(e).with_context(|| format!("batch {}", batch.range));
                }
            }
        }
        pb.inc(batch.range.len() as u64);
        pb.set_message(format!("at {}", batch.range.end));
    }
    pb.finish_with_message("done");

    let elapsed = started.elapsed();
    info!(
        "Downloaded {} blocks in {:.2}s ({:.1} blocks/s), {} cached",
        range.len(),
        elapsed.as_secs_f64(),
        range.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        cache.count()?
    );
    Ok(())
}

async fn run_rewind_cache(network: NetworkType, cache_path: PathBuf, height: u32) -> anyhow::Result<()> {
    let cache = SqliteBlockCache::open(&cache_path, network)
        .with_context(|| format!("opening cache {}", cache_path.display()))?;
    let height = BlockHeight::new(height as u64, network)?;

    let before = cache.highest_height().await?;
    cache.truncate_above(height).await?;
    let after = cache.highest_height().await?;
    info!(
        "Rewound cache {}: highest {:?} -> {:?}",
        cache_path.display(),
        before.map(|h| h.value()),
        after.map(|h| h.value())
    );
    Ok(())
}
