//! BLE Scanner Module
//!
//! Starts and stops scans and decides whether an advertisement belongs to the
//! configured peripheral.

use crate::domain::models::ServiceId;
use crate::infrastructure::bluetooth::protocol::{Advertisement, RadioCommand, RadioLink};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// BLE Scanner for the configured peripheral
pub struct BleScanner {
    link: RadioLink,
    device_name: String,
    scanning: bool,
}

impl BleScanner {
    pub fn new(link: RadioLink, device_name: impl Into<String>) -> Self {
        Self {
            link,
            device_name: device_name.into(),
            scanning: false,
        }
    }

    /// Start scanning, filtered to `services`
    pub fn start(&mut self, services: &BTreeSet<ServiceId>) {
        info!(
            "Starting BLE scan for '{}' ({} service filter(s))",
            self.device_name,
            services.len()
        );
        self.link.submit(RadioCommand::StartScan {
            services: services.iter().copied().collect(),
        });
        self.scanning = true;
    }

    /// Stop scanning
    pub fn stop(&mut self) {
        if self.scanning {
            info!("Stopping BLE scan...");
        }
        // Sent even when idle; stopping is always safe
        self.link.submit(RadioCommand::StopScan);
        self.scanning = false;
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Radio lost power; any scan in flight is gone
    pub fn reset(&mut self) {
        self.scanning = false;
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The peripheral name or the advertised local name must equal the
    /// configured device name exactly
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        let matched = [&advertisement.name, &advertisement.local_name]
            .into_iter()
            .flatten()
            .any(|name| name == &self.device_name);

        debug!(
            "Advertisement from {} name={:?} local_name={:?} rssi={:?} matched={}",
            advertisement.peripheral,
            advertisement.name,
            advertisement.local_name,
            advertisement.rssi,
            matched
        );
        matched
    }
}
