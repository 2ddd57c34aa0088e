//! Delivery client: send now, or queue for the scheduler to retry

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::transport::{DeliveryOutcome, HttpTransport, Transport};
use crate::config::{CacheConfig, Config};
use crate::error::Result;
use crate::payload::Payload;
use crate::queue::PersistentQueue;

/// What happened to a payload handed to [`DeliveryClient::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Stored for retry; `evicted` is set when the oldest queued payload
    /// was discarded to make room.
    Queued { evicted: bool },
}

/// Summary of one drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub evicted: usize,
}

/// Counters since the client was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub queued: u64,
    pub evicted: u64,
    pub failed_attempts: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    queued: AtomicU64,
    evicted: AtomicU64,
    failed_attempts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Sends payloads to the collector, falling back to the persistent queue.
///
/// `send` may be called from any task while a drain cycle is running: the
/// queue serializes its own mutations and the drain only ever works on
/// entries it has claimed.
pub struct DeliveryClient<T = HttpTransport> {
    transport: Option<T>,
    queue: PersistentQueue,
    max_retries: usize,
    retry_period: Duration,
    drain_gate: Mutex<()>,
    counters: Counters,
}

impl DeliveryClient<HttpTransport> {
    /// Open a client wired to the HTTP collector described by `config`
    pub async fn from_config(config: &Config) -> Result<Self> {
        let transport = match &config.server {
            Some(server) => HttpTransport::from_config(server)?,
            None => None,
        };
        Self::open(&config.cache, transport).await
    }
}

impl<T: Transport> DeliveryClient<T> {
    /// Open the queue under `config.directory`.
    ///
    /// Without a transport nothing is ever attempted: payloads are queued
    /// until a client with an endpoint drains them.
    pub async fn open(config: &CacheConfig, transport: Option<T>) -> Result<Self> {
        config.validate()?;
        let queue = PersistentQueue::open(&config.directory, config.max_entries).await?;

        if transport.is_none() {
            warn!("No collector endpoint configured, payloads will only be queued");
        }

        Ok(Self {
            transport,
            queue,
            max_retries: config.max_retries,
            retry_period: config.retry_period(),
            drain_gate: Mutex::new(()),
            counters: Counters::default(),
        })
    }

    /// Attempt immediate delivery, queueing the payload on any failure.
    ///
    /// Delivery problems never surface as errors. `Err` means the queue
    /// itself could not be written.
    pub async fn send(&self, payload: &Payload) -> Result<SendOutcome> {
        let body = payload.to_body()?;

        let Some(transport) = &self.transport else {
            debug!(status = payload.status.as_str(), "Queueing payload, no endpoint");
            let evicted = self.enqueue_body(&body).await?;
            return Ok(SendOutcome::Queued { evicted });
        };

        match transport.attempt(&body).await {
            DeliveryOutcome::Delivered => {
                Counters::bump(&self.counters.delivered);
                info!(
                    device = %payload.device,
                    status = payload.status.as_str(),
                    "Delivered payload"
                );
                Ok(SendOutcome::Delivered)
            }
            DeliveryOutcome::TransientFailure(reason) => {
                Counters::bump(&self.counters.failed_attempts);
                warn!(
                    device = %payload.device,
                    reason = %reason,
                    "Delivery failed, queueing payload for retry"
                );
                let evicted = self.enqueue_body(&body).await?;
                Ok(SendOutcome::Queued { evicted })
            }
        }
    }

    /// Append a payload to the queue without attempting delivery.
    ///
    /// Returns whether the oldest queued payload was evicted.
    pub async fn enqueue(&self, payload: &Payload) -> Result<bool> {
        self.enqueue_body(&payload.to_body()?).await
    }

    async fn enqueue_body(&self, body: &[u8]) -> Result<bool> {
        let evicted = self.queue.push_back(body).await?;
        Counters::bump(&self.counters.queued);
        Ok(self.note_eviction(evicted))
    }

    fn note_eviction(&self, evicted: Option<Vec<u8>>) -> bool {
        match evicted {
            Some(dropped) => {
                Counters::bump(&self.counters.evicted);
                debug!(
                    payload = %String::from_utf8_lossy(&dropped),
                    "Discarded payload"
                );
                true
            }
            None => false,
        }
    }

    /// Retry up to `max_retries` queued payloads, oldest first.
    ///
    /// Each payload is claimed before the attempt and only removed for good
    /// once delivered; failures go back to the tail. Overlapping calls are
    /// serialized.
    pub async fn drain_cycle(&self) -> Result<DrainReport> {
        let _gate = self.drain_gate.lock().await;
        let mut report = DrainReport::default();

        let Some(transport) = &self.transport else {
            debug!("Skipping drain cycle, no endpoint");
            return Ok(report);
        };

        let pending = self.queue.len().await;
        let batch = self.max_retries.min(pending);
        if batch == 0 {
            return Ok(report);
        }
        info!(pending, batch, "Retrying queued payloads");

        for _ in 0..batch {
            let Some(claim) = self.queue.claim_front().await? else {
                break;
            };
            report.attempted += 1;

            let outcome = transport.attempt(claim.payload()).await;
            match outcome {
                DeliveryOutcome::Delivered => {
                    self.queue.acknowledge(claim).await?;
                    Counters::bump(&self.counters.delivered);
                    report.delivered += 1;
                }
                DeliveryOutcome::TransientFailure(reason) => {
                    Counters::bump(&self.counters.failed_attempts);
                    debug!(seq = claim.seq(), reason = %reason, "Retry failed, requeueing");
                    let evicted = self.queue.requeue(claim).await?;
                    report.requeued += 1;
                    if self.note_eviction(evicted) {
                        report.evicted += 1;
                    }
                }
            }
        }

        let remaining = self.queue.len().await;
        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            requeued = report.requeued,
            remaining,
            "Drain cycle finished"
        );
        Ok(report)
    }

    /// Number of queued payloads, not counting one a running drain holds
    pub async fn pending(&self) -> usize {
        self.queue.len().await
    }

    pub fn stats(&self) -> DeliveryStats {
        self.counters.snapshot()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Configured time between drain cycles
    pub fn retry_period(&self) -> Duration {
        self.retry_period
    }

    pub fn queue(&self) -> &PersistentQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ConnectionStatus, Device};
    use chrono::Local;
    use std::future::Future;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    struct Toggle {
        up: AtomicBool,
        calls: AtomicU64,
    }

    impl Toggle {
        fn new(up: bool) -> Self {
            Self {
                up: AtomicBool::new(up),
                calls: AtomicU64::new(0),
            }
        }
    }

    impl Transport for Toggle {
        fn attempt(&self, _body: &[u8]) -> impl Future<Output = DeliveryOutcome> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = if self.up.load(Ordering::SeqCst) {
                DeliveryOutcome::Delivered
            } else {
                DeliveryOutcome::TransientFailure("down".to_string())
            };
            async move { outcome }
        }
    }

    fn cache_config(dir: &TempDir, max_entries: usize, max_retries: usize) -> CacheConfig {
        CacheConfig {
            directory: dir.path().join("queue"),
            max_entries,
            max_retries,
            retry_period_seconds: 0.05,
        }
    }

    fn payload(serial: &str) -> Payload {
        Payload::with_metadata(
            Device {
                vendor_id: 1,
                product_id: 2,
                serial_number: serial.to_string(),
            },
            ConnectionStatus::Connected,
            "tester".to_string(),
            "host".to_string(),
            Local::now(),
        )
    }

    #[tokio::test]
    async fn test_send_delivers_without_queueing() {
        let dir = TempDir::new().unwrap();
        let client = DeliveryClient::open(&cache_config(&dir, 5, 3), Some(Toggle::new(true)))
            .await
            .unwrap();

        assert_eq!(client.send(&payload("a")).await.unwrap(), SendOutcome::Delivered);
        assert_eq!(client.pending().await, 0);
        assert_eq!(client.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_send_queues_on_failure() {
        let dir = TempDir::new().unwrap();
        let client = DeliveryClient::open(&cache_config(&dir, 5, 3), Some(Toggle::new(false)))
            .await
            .unwrap();

        assert_eq!(
            client.send(&payload("a")).await.unwrap(),
            SendOutcome::Queued { evicted: false }
        );
        assert_eq!(client.pending().await, 1);

        let stats = client.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.failed_attempts, 1);
    }

    #[tokio::test]
    async fn test_without_transport_never_drains() {
        let dir = TempDir::new().unwrap();
        let client = DeliveryClient::<Toggle>::open(&cache_config(&dir, 5, 3), None)
            .await
            .unwrap();

        client.send(&payload("a")).await.unwrap();
        assert!(!client.has_transport());
        assert_eq!(client.drain_cycle().await.unwrap(), DrainReport::default());
        assert_eq!(client.pending().await, 1);
    }

    #[tokio::test]
    async fn test_enqueue_reports_eviction() {
        let dir = TempDir::new().unwrap();
        let client = DeliveryClient::open(&cache_config(&dir, 1, 3), Some(Toggle::new(true)))
            .await
            .unwrap();

        assert!(!client.enqueue(&payload("a")).await.unwrap());
        assert!(client.enqueue(&payload("b")).await.unwrap());
        assert_eq!(client.pending().await, 1);
        assert_eq!(client.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_drain_cycle_respects_batch_limit() {
        let dir = TempDir::new().unwrap();
        let transport = std::sync::Arc::new(Toggle::new(false));
        let client = DeliveryClient::open(&cache_config(&dir, 10, 2), Some(transport.clone()))
            .await
            .unwrap();
        for serial in ["a", "b", "c", "d"] {
            client.enqueue(&payload(serial)).await.unwrap();
        }

        transport.up.store(true, Ordering::SeqCst);
        let report = client.drain_cycle().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(client.pending().await, 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn test_drain_cycle_future_can_move_between_threads() {
        let dir = TempDir::new().unwrap();
        let client = DeliveryClient::open(&cache_config(&dir, 5, 3), Some(Toggle::new(true)))
            .await
            .unwrap();

        assert_send(client.drain_cycle());
        assert_send(client.send(&payload("a")));

        client.enqueue(&payload("b")).await.unwrap();
        let client = std::sync::Arc::new(client);
        let report = tokio::spawn({
            let client = client.clone();
            async move { client.drain_cycle().await }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_invalid_cache_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = DeliveryClient::<Toggle>::open(&cache_config(&dir, 5, 0), None).await;
        assert!(matches!(result, Err(crate::error::Error::Config(_))));
    }
}
