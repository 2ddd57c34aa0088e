//! Event payloads reported to the collector
//!
//! One payload is produced per device transition. The JSON shape matches
//! what the collector's `usb-logs` endpoint accepts:
//!
//! ```json
//! {
//!   "username": "jdoe",
//!   "hostname": "lab-pc-07",
//!   "timestamp": "2022-04-07 12:11:02.000000",
//!   "device": { "vendor_id": 1133, "product_id": 49271, "serial_number": "A1B2" },
//!   "status": "connected"
//! }
//! ```

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timestamp layout expected by the collector (`%Y-%m-%d %H:%M:%S.%f` on its side)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Identity of a peripheral device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: String,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} ({})",
            self.vendor_id, self.product_id, self.serial_number
        )
    }
}

/// Whether a device was just plugged in or removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

/// One device event, as sent to the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub username: String,
    pub hostname: String,
    pub timestamp: String,
    pub device: Device,
    pub status: ConnectionStatus,
}

impl Payload {
    /// Build a payload stamped with this host's identity and the current time
    pub fn new(device: Device, status: ConnectionStatus) -> Self {
        Self::with_metadata(device, status, current_username(), current_hostname(), Local::now())
    }

    /// Build a payload from explicit metadata
    pub fn with_metadata(
        device: Device,
        status: ConnectionStatus,
        username: String,
        hostname: String,
        at: DateTime<Local>,
    ) -> Self {
        Self {
            username,
            hostname,
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            device,
            status,
        }
    }

    /// Serialize into the request body. Queued payloads are stored in this form.
    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
