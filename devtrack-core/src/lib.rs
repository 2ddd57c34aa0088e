//! # devtrack-core
//!
//! Core library for devtrack - a USB device activity reporter.
//!
//! This library provides:
//! - Device detection with a persisted snapshot of attached devices
//! - Event payloads in the collector's JSON shape
//! - A crash-safe, bounded FIFO queue for payloads that could not be sent
//! - The delivery client and the scheduler that drains the queue
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Delivery model
//!
//! Every event gets one immediate delivery attempt. On failure it is
//! appended to the on-disk queue; when the queue is full the oldest entry is
//! discarded. Every retry period the scheduler retries a bounded batch from
//! the front, putting failures back at the tail.
//!
//! ## Example
//!
//! ```rust,no_run
//! use devtrack_core::{Config, DeliveryClient};
//!
//! # async fn demo() -> devtrack_core::Result<()> {
//! let config = Config::load()?;
//! let client = DeliveryClient::from_config(&config).await?;
//! println!("{} payloads waiting", client.pending().await);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use delivery::{
    DeliveryClient, DeliveryOutcome, DeliveryStats, DrainReport, HttpTransport, Scheduler,
    SendOutcome, Transport,
};
pub use detector::{DeviceDetector, DeviceEvent, DeviceSource, Scan, SysfsUsbSource};
pub use error::{Error, Result};
pub use payload::{ConnectionStatus, Device, Payload};
pub use queue::PersistentQueue;

// Public modules
pub mod config;
pub mod delivery;
pub mod detector;
pub mod error;
pub mod logging;
pub mod payload;
pub mod queue;
