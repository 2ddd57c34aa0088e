//! Device presence tracking
//!
//! The detector compares what a [`DeviceSource`] reports against the last
//! snapshot and turns the difference into connect/disconnect events. The
//! snapshot is persisted so that devices plugged or unplugged while the
//! daemon was down are still reported on the next start.
//!
//! A scan does not move the snapshot. The caller commits it once every
//! event has been handed off, so a crash in between replays the events.

mod sysfs;

pub use sysfs::SysfsUsbSource;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::payload::{ConnectionStatus, Device};

/// Something that can list the currently attached devices
pub trait DeviceSource: Send {
    fn connected_devices(&mut self) -> Result<Vec<Device>>;
}

/// A single observed transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub device: Device,
    pub status: ConnectionStatus,
}

/// Devices present in `detected` but not in `last`
pub fn newly_connected(detected: &[Device], last: &[Device]) -> Vec<Device> {
    detected
        .iter()
        .filter(|device| !last.contains(device))
        .cloned()
        .collect()
}

/// Devices present in `last` but not in `detected`
pub fn newly_disconnected(detected: &[Device], last: &[Device]) -> Vec<Device> {
    newly_connected(last, detected)
}

/// Outcome of one poll, pending [`DeviceDetector::commit`]
#[derive(Debug, Default)]
pub struct Scan {
    pub events: Vec<DeviceEvent>,
    detected: Vec<Device>,
}

impl Scan {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct DeviceDetector<S> {
    source: S,
    snapshot_path: PathBuf,
    last: Vec<Device>,
}

impl<S: DeviceSource> DeviceDetector<S> {
    /// Create a detector, seeding it from the snapshot at `snapshot_path`.
    ///
    /// A missing or unreadable snapshot starts from an empty device list.
    pub fn new(source: S, snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let last = load_snapshot(&snapshot_path);
        Self {
            source,
            snapshot_path,
            last,
        }
    }

    /// Poll the source once and report what changed since the last commit.
    ///
    /// Connect events come before disconnect events. Until the scan is
    /// committed, later scans keep reporting the same transitions.
    pub fn scan(&mut self) -> Result<Scan> {
        let detected = self.source.connected_devices()?;
        let connected = newly_connected(&detected, &self.last);
        let disconnected = newly_disconnected(&detected, &self.last);

        if connected.is_empty() && disconnected.is_empty() {
            return Ok(Scan::default());
        }

        debug!(
            connected = connected.len(),
            disconnected = disconnected.len(),
            "Device set changed"
        );

        let events = connected
            .into_iter()
            .map(|device| DeviceEvent {
                device,
                status: ConnectionStatus::Connected,
            })
            .chain(disconnected.into_iter().map(|device| DeviceEvent {
                device,
                status: ConnectionStatus::Disconnected,
            }))
            .collect();
        Ok(Scan { events, detected })
    }

    /// Record a scan's device list as the new baseline and persist it.
    ///
    /// The in-memory baseline moves even when the write fails, so a broken
    /// snapshot file does not replay the same events every poll.
    pub fn commit(&mut self, scan: Scan) -> Result<()> {
        if scan.is_empty() {
            return Ok(());
        }
        self.last = scan.detected;
        store_snapshot(&self.snapshot_path, &self.last)
    }

    /// Devices as of the most recent commit
    pub fn last_seen(&self) -> &[Device] {
        &self.last
    }
}

fn load_snapshot(path: &Path) -> Vec<Device> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read device snapshot");
            return Vec::new();
        }
    };

    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Ignoring malformed device snapshot");
        Vec::new()
    })
}

fn store_snapshot(path: &Path, devices: &[Device]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(devices)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
