//! Periodic drain of the retry queue

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::client::DeliveryClient;
use super::transport::Transport;
use crate::error::Result;

/// Runs [`DeliveryClient::drain_cycle`] every `period` until told to stop.
///
/// The first cycle runs one full period after start. Shutdown is signalled by
/// sending `true` on the watch channel (or dropping the sender) and takes
/// effect immediately while sleeping, or right after the current cycle.
pub struct Scheduler<T> {
    client: Arc<DeliveryClient<T>>,
    period: Duration,
}

impl<T: Transport + 'static> Scheduler<T> {
    pub fn new(client: Arc<DeliveryClient<T>>, period: Duration) -> Self {
        Self { client, period }
    }

    /// Drive the loop on the current task.
    ///
    /// Returns `Err` only when the queue could not be read or written; the
    /// loop stops at that point.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            period_secs = self.period.as_secs_f64(),
            "Retry scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.client.drain_cycle().await {
                error!(error = %e, "Drain cycle failed, stopping retry scheduler");
                return Err(e);
            }
        }

        info!("Retry scheduler stopped");
        Ok(())
    }

    /// Spawn the loop as a tokio task
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }
}
