//! ARP Collector Daemon
//!
//! Main entry point for arpcollectord. Watches every local IPv4 network and
//! mirrors its neighbors into Redis until SIGINT.

use arp_collector::config::DEFAULT_CONFIG_PATH;
use arp_collector::{
    Collector, CollectorError, CollectordConfig, KernelWatcherBuilder, RedisCacheWriter, Result,
    SystemNetworkEnumerator, run_sink,
};
use arp_types::Ipv4Network;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Multi-interface ARP collector
#[derive(Parser, Debug)]
#[command(name = "arpcollectord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log watcher activity at debug level
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Subnet to monitor (repeatable); replaces the configured list
    #[arg(short = 's', long = "subnet")]
    subnets: Vec<Ipv4Network>,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    info!("arpcollectord: Starting ARP collector");

    match run_daemon(args).await {
        Ok(()) => {
            info!("arpcollectord: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "arpcollectord: Daemon exiting with error");
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

/// Initialize structured logging; `RUST_LOG` overrides the level
fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CollectorError::Config(format!("Failed to set logger: {}", e)))?;

    Ok(())
}

fn load_config(args: &Args) -> Result<CollectordConfig> {
    let mut config = CollectordConfig::load_or_default(&args.config)?;
    if args.verbose {
        config.arp.verbose = true;
    }
    if !args.subnets.is_empty() {
        config.arp.subnets = args.subnets.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_daemon(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    info!(
        config = %args.config.display(),
        subnets = config.arp.subnets.len(),
        redis = %config.redis.url(),
        "arpcollectord: Configuration loaded"
    );

    let writer = RedisCacheWriter::connect(&config.redis).await?;

    let collector = Arc::new(Collector::new(
        &config.arp,
        &SystemNetworkEnumerator::default(),
        &KernelWatcherBuilder,
    )?);
    for network in collector.networks() {
        info!(
            interface = %network.interface.name,
            network = %network.network,
            gateway = ?network.gateway,
            "arpcollectord: Watching network"
        );
    }

    let stream = collector
        .take_cache_stream()
        .ok_or_else(|| CollectorError::Config("cache stream already taken".to_string()))?;
    let sink = tokio::spawn(run_sink(stream, writer));

    let starter = {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move { collector.start().await })
    };

    wait_for_shutdown().await;

    collector.close().await;
    if let Err(e) = starter.await {
        warn!(error = %e, "arpcollectord: Start task failed");
    }
    match sink.await {
        Ok(written) => info!(written, "arpcollectord: Cache sink drained"),
        Err(e) => warn!(error = %e, "arpcollectord: Cache sink failed"),
    }

    debug!(metrics = %collector.metrics().gather_text(), "arpcollectord: Final metrics");
    info!("arpcollectord: Graceful shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("arpcollectord: Received SIGINT"),
        Err(e) => warn!(error = %e, "arpcollectord: Failed to listen for SIGINT, shutting down"),
    }
}
