//! devtrack - report USB device connect/disconnect events to a collector
//!
//! Runs two loops until interrupted:
//! - the device detector, which scans for attached devices and sends one
//!   payload per transition
//! - the retry scheduler, which periodically drains payloads that could not
//!   be delivered
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/devtrack/queue/ (~/.local/share/devtrack/queue/)
//! - Logs: $XDG_STATE_HOME/devtrack/ (~/.local/state/devtrack/)
//! - Config: $XDG_CONFIG_HOME/devtrack/config.toml (~/.config/devtrack/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use devtrack_core::{
    Config, DeliveryClient, DeviceDetector, DeviceSource, Payload, Scheduler, SendOutcome,
    SysfsUsbSource,
};
use process_lock::acquire_queue_guard;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

#[derive(Parser)]
#[command(name = "devtrack")]
#[command(about = "Report USB device connect/disconnect events to a collector")]
#[command(version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/devtrack/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print each reported event to stdout
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let _log_guard =
        devtrack_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("devtrack starting");

    let queue_dir = config.cache.directory.clone();
    std::fs::create_dir_all(&queue_dir)
        .with_context(|| format!("failed to create queue directory: {}", queue_dir.display()))?;
    let _queue_guard =
        acquire_queue_guard(&queue_dir, "devtrack").context("failed to acquire process lock")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create async runtime")?;

    let result = runtime.block_on(run(config, args.verbose));
    if let Err(e) = &result {
        tracing::error!(error = %e, "devtrack stopped");
    } else {
        tracing::info!("devtrack stopped");
    }
    result
}

async fn run(config: Config, verbose: u8) -> Result<()> {
    let client = Arc::new(
        DeliveryClient::from_config(&config)
            .await
            .context("failed to open delivery client")?,
    );

    match config.endpoint_uri() {
        Some(uri) => println!("Collector: {}", uri),
        None => println!("Collector: not configured, events are queued only"),
    }
    println!(
        "Queue: {} ({} pending)",
        config.cache.directory.display(),
        client.pending().await
    );

    // Set up signal handler for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        let _ = shutdown_tx.send(true);
    })
    .context("failed to set Ctrl+C handler")?;

    let detector = DeviceDetector::new(
        SysfsUsbSource::new(&config.detector.sysfs_root),
        &config.detector.connected_devices_filename,
    );

    let mut scheduler =
        Scheduler::new(client.clone(), config.cache.retry_period()).spawn(shutdown_rx.clone());
    let mut detection = tokio::spawn(detect_loop(
        detector,
        client.clone(),
        config.detector.scan_period(),
        shutdown_rx,
        verbose,
    ));

    println!("Watching for devices. Press Ctrl+C to stop.");

    // A storage failure in either loop ends the process; dropping the
    // runtime cancels the other one.
    tokio::select! {
        joined = &mut scheduler => {
            task_result("retry scheduler", joined)?;
            task_result("device detector", detection.await)?;
        }
        joined = &mut detection => {
            task_result("device detector", joined)?;
            task_result("retry scheduler", scheduler.await)?;
        }
    }

    let stats = client.stats();
    tracing::info!(
        delivered = stats.delivered,
        queued = stats.queued,
        evicted = stats.evicted,
        failed_attempts = stats.failed_attempts,
        pending = client.pending().await,
        "Delivery stats"
    );
    Ok(())
}

fn task_result(
    name: &str,
    joined: std::result::Result<devtrack_core::Result<()>, JoinError>,
) -> Result<()> {
    joined
        .with_context(|| format!("{} task panicked", name))?
        .with_context(|| format!("{} failed", name))
}

/// Scan for device transitions and send one payload per event
async fn detect_loop<S: DeviceSource + 'static>(
    mut detector: DeviceDetector<S>,
    client: Arc<DeliveryClient>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    verbose: u8,
) -> devtrack_core::Result<()> {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let (returned, scanned) = on_blocking_pool(detector, |detector| detector.scan()).await?;
        detector = returned;

        match scanned {
            Ok(scan) if !scan.is_empty() => {
                for event in &scan.events {
                    let payload = Payload::new(event.device.clone(), event.status);
                    let outcome = client.send(&payload).await?;
                    if verbose > 0 {
                        let note = match outcome {
                            SendOutcome::Delivered => "delivered",
                            SendOutcome::Queued { .. } => "queued",
                        };
                        println!("{} {} [{}]", payload.status.as_str(), payload.device, note);
                    }
                }

                // Every event is delivered or queued; only now move the baseline.
                let (returned, committed) =
                    on_blocking_pool(detector, move |detector| detector.commit(scan)).await?;
                detector = returned;
                if let Err(e) = committed {
                    tracing::warn!(error = %e, "Could not persist device snapshot");
                }
            }
            Ok(_) => {}
            // Enumeration failures are usually transient (device mid-removal)
            Err(e) => tracing::warn!(error = %e, "Device scan failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!("Device detector stopped");
    Ok(())
}

/// Run `work` against the detector on the blocking pool and hand it back
async fn on_blocking_pool<S, T, F>(
    mut detector: DeviceDetector<S>,
    work: F,
) -> devtrack_core::Result<(DeviceDetector<S>, T)>
where
    S: DeviceSource + 'static,
    T: Send + 'static,
    F: FnOnce(&mut DeviceDetector<S>) -> T + Send + 'static,
{
    let task: JoinHandle<_> = tokio::task::spawn_blocking(move || {
        let output = work(&mut detector);
        (detector, output)
    });
    task.await.map_err(|e| {
        tracing::error!(error = %e, "Device detector task panicked");
        devtrack_core::Error::Device(format!("detector task panicked: {}", e))
    })
}
