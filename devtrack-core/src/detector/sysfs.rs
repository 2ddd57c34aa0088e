//! USB enumeration from the Linux sysfs tree

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::DeviceSource;
use crate::error::{Error, Result};
use crate::payload::Device;

/// Lists USB devices under `/sys/bus/usb/devices`.
///
/// Interfaces and root hubs are skipped. Devices whose serial number cannot
/// be read are left out and warned about once until they disappear.
pub struct SysfsUsbSource {
    root: PathBuf,
    unreadable: HashSet<String>,
}

impl SysfsUsbSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            unreadable: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DeviceSource for SysfsUsbSource {
    fn connected_devices(&mut self) -> Result<Vec<Device>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            Error::Device(format!("failed to list {}: {}", self.root.display(), e))
        })?;

        let mut devices = Vec::new();
        let mut unreadable = HashSet::new();

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("usb") {
                continue;
            }

            let path = entry.path();
            let (Some(vendor_id), Some(product_id)) = (
                read_hex_id(&path.join("idVendor")),
                read_hex_id(&path.join("idProduct")),
            ) else {
                continue;
            };

            match read_attribute(&path.join("serial")) {
                Some(serial_number) => {
                    if self.unreadable.contains(&name) {
                        info!(device = %name, "Serial number readable again");
                    }
                    devices.push(Device {
                        vendor_id,
                        product_id,
                        serial_number,
                    });
                }
                None => {
                    if !self.unreadable.contains(&name) {
                        warn!(
                            device = %name,
                            vendor_id = %format!("{:04x}", vendor_id),
                            product_id = %format!("{:04x}", product_id),
                            "Could not read serial number, ignoring device"
                        );
                    }
                    unreadable.insert(name);
                }
            }
        }

        self.unreadable = unreadable;
        devices.sort_by(|a, b| {
            (a.vendor_id, a.product_id, &a.serial_number)
                .cmp(&(b.vendor_id, b.product_id, &b.serial_number))
        });
        devices.dedup();
        Ok(devices)
    }
}

fn read_attribute(path: &Path) -> Option<String> {
    let value = fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn read_hex_id(path: &Path) -> Option<u16> {
    u16::from_str_radix(&read_attribute(path)?, 16).ok()
}
