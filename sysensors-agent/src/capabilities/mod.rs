//! Optional capability detection
//!
//! Some sensors depend on hardware or tooling that is not present everywhere:
//! - Under-voltage monitoring (Raspberry Pi `rpi_volt` hwmon device)
//! - Pending package updates (`apt-get`)
//!
//! Sensors gated by an unavailable capability are forced disabled at startup.

use crate::execution::{run_bounded, COMMAND_TIMEOUT};
use crate::facts;
use tracing::debug;

/// Supported capability types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityType {
    PowerMonitor,
    PackageUpdates,
}

impl CapabilityType {
    /// Sensor id that cannot be read without this capability
    pub fn gated_sensor(self) -> &'static str {
        match self {
            CapabilityType::PowerMonitor => "power_status",
            CapabilityType::PackageUpdates => "updates",
        }
    }
}

/// Capability detection result
#[derive(Debug, Clone)]
pub struct CapabilityInfo {
    pub capability_type: CapabilityType,
    pub available: bool,
    pub reason: Option<String>,
}

impl CapabilityInfo {
    pub fn available(capability_type: CapabilityType) -> Self {
        Self {
            capability_type,
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(capability_type: CapabilityType, reason: impl Into<String>) -> Self {
        Self {
            capability_type,
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Host capability detector
pub struct CapabilityDetector;

impl CapabilityDetector {
    /// Detect every optional capability on this host
    pub fn detect_all() -> Vec<CapabilityInfo> {
        debug!("Detecting optional capabilities...");

        let capabilities = vec![Self::detect_power_monitor(), Self::detect_package_updates()];

        let available_count = capabilities.iter().filter(|c| c.available).count();
        debug!("Detected {}/{} capabilities available", available_count, capabilities.len());

        capabilities
    }

    fn detect_power_monitor() -> CapabilityInfo {
        match facts::locate_under_voltage_alarm() {
            Some(_) => CapabilityInfo::available(CapabilityType::PowerMonitor),
            None => CapabilityInfo::unavailable(
                CapabilityType::PowerMonitor,
                "no rpi_volt hwmon device found, power supply info will not be shown",
            ),
        }
    }

    fn detect_package_updates() -> CapabilityInfo {
        if Self::command_exists("apt-get") {
            CapabilityInfo::available(CapabilityType::PackageUpdates)
        } else {
            CapabilityInfo::unavailable(
                CapabilityType::PackageUpdates,
                "apt-get not found, available updates will not be shown",
            )
        }
    }

    /// Check if a command exists in PATH
    fn command_exists(command: &str) -> bool {
        run_bounded("which", &[command], COMMAND_TIMEOUT).is_ok()
    }
}
