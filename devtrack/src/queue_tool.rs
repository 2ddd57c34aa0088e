//! devtrack-queue - inspect and flush the devtrack retry queue
//!
//! Operates on the same queue directory as the daemon and refuses to run
//! while the daemon owns it.

mod process_lock;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use devtrack_core::{Config, DeliveryClient};
use process_lock::acquire_queue_guard;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devtrack-queue")]
#[command(about = "Inspect and flush the devtrack retry queue")]
#[command(version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/devtrack/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show queue location, limits and pending payload count
    Status,
    /// Run drain cycles now instead of waiting for the daemon's schedule
    Drain {
        /// Number of drain cycles to run (stops early once the queue is empty)
        #[arg(short = 'n', long, default_value = "1")]
        cycles: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let _log_guard =
        devtrack_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let queue_dir = config.cache.directory.clone();
    std::fs::create_dir_all(&queue_dir)
        .with_context(|| format!("failed to create queue directory: {}", queue_dir.display()))?;
    let _queue_guard = acquire_queue_guard(&queue_dir, "devtrack-queue")
        .context("failed to acquire process lock")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    runtime.block_on(async {
        let client = DeliveryClient::from_config(&config)
            .await
            .context("failed to open delivery client")?;

        match &args.command {
            Command::Status => print_status(&config, &client).await,
            Command::Drain { cycles } => drain(&client, *cycles, args.verbose).await,
        }
    })
}

async fn print_status(config: &Config, client: &DeliveryClient) -> Result<()> {
    println!(
        "Endpoint:      {}",
        config
            .endpoint_uri()
            .unwrap_or_else(|| "<not configured>".to_string())
    );
    println!("Queue:         {}", config.cache.directory.display());
    println!("Capacity:      {}", config.cache.max_entries);
    println!("Max retries:   {}", client.max_retries());
    println!("Retry period:  {}s", client.retry_period().as_secs_f64());
    println!("Pending:       {}", client.pending().await);
    Ok(())
}

async fn drain(client: &DeliveryClient, cycles: usize, verbose: u8) -> Result<()> {
    if !client.has_transport() {
        println!("No collector endpoint configured; nothing to drain");
        println!("Pending: {}", client.pending().await);
        return Ok(());
    }

    let mut delivered = 0;
    let mut requeued = 0;
    for cycle in 1..=cycles {
        if client.pending().await == 0 {
            break;
        }

        let report = client
            .drain_cycle()
            .await
            .with_context(|| format!("drain cycle {} failed", cycle))?;
        delivered += report.delivered;
        requeued += report.requeued;

        if verbose > 0 {
            println!(
                "Cycle {}: attempted {}, delivered {}, requeued {}, evicted {}",
                cycle, report.attempted, report.delivered, report.requeued, report.evicted
            );
        }
    }

    println!("Delivered: {}", delivered);
    println!("Requeued:  {}", requeued);
    println!("Pending:   {}", client.pending().await);
    Ok(())
}
