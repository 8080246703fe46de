//! Host facts provider
//!
//! Typed accessors over the operating system:
//! - CPU usage, clock speed and temperature
//! - Memory, swap and disk usage
//! - Load averages and network byte counters
//! - Host identity (hostname, IP, OS, architecture)
//! - Wireless link quality and SSID
//! - Raspberry Pi under-voltage alarm and pending package updates
//!
//! A single [`HostFacts`] is owned by the polling side of the agent and handed
//! to sensor accessors by mutable reference; `sysinfo` needs the previous
//! refresh to compute CPU usage, so the handles live across cycles.

use crate::execution::{run_bounded, CommandError, COMMAND_TIMEOUT};
use chrono::{SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use std::path::{Path, PathBuf};
use sysinfo::{Components, CpuRefreshKind, Disks, Networks, System};
use thiserror::Error;
use tracing::debug;

const OS_RELEASE_PATH: &str = "/etc/os-release";
const WIRELESS_PATH: &str = "/proc/net/wireless";
const HWMON_ROOT: &str = "/sys/class/hwmon";
const THERMAL_ZONE_TEMP: &str = "/sys/class/thermal/thermal_zone0/temp";
const WIFI_INTERFACE: &str = "wlan0";

/// Component label fragments identifying the CPU package, by priority
const CPU_SENSOR_LABELS: &[&str] = &["cpu_thermal", "cpu-thermal", "coretemp", "k10temp"];

/// Failure of a single sensor read
#[derive(Debug, Error)]
pub enum AccessorError {
    #[error("{0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("value is not a finite number")]
    NonFinite,

    #[error("accessor panicked: {0}")]
    Panicked(String),
}

/// Cumulative byte counters summed over all interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkTotals {
    pub transmitted: u64,
    pub received: u64,
}

/// Owned handles and static metadata used by sensor accessors
pub struct HostFacts {
    system: System,
    networks: Networks,
    components: Components,
    timezone: Tz,
    os_pretty_name: Option<String>,
    under_voltage_alarm: Option<PathBuf>,
}

impl HostFacts {
    pub fn new(timezone: Tz) -> Self {
        Self {
            system: System::new(),
            networks: Networks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
            timezone,
            os_pretty_name: read_os_pretty_name(),
            under_voltage_alarm: locate_under_voltage_alarm(),
        }
    }

    /// Global CPU usage since the previous call
    pub fn cpu_usage(&mut self) -> f32 {
        self.system.refresh_cpu_usage();
        self.system.global_cpu_info().cpu_usage()
    }

    pub fn clock_speed_mhz(&mut self) -> Result<u64, AccessorError> {
        self.system
            .refresh_cpu_specifics(CpuRefreshKind::new().with_frequency());
        self.system
            .cpus()
            .first()
            .map(|cpu| cpu.frequency())
            .filter(|mhz| *mhz > 0)
            .ok_or_else(|| AccessorError::Unavailable("CPU frequency not reported".to_string()))
    }

    /// Used memory percentage, counting reclaimable memory as available
    pub fn memory_percent(&mut self) -> Result<f64, AccessorError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(AccessorError::Unavailable("total memory reported as 0".to_string()));
        }
        let used = total.saturating_sub(self.system.available_memory());
        Ok(used as f64 / total as f64 * 100.0)
    }

    pub fn swap_percent(&mut self) -> f64 {
        self.system.refresh_memory();
        let total = self.system.total_swap();
        if total == 0 {
            return 0.0;
        }
        self.system.used_swap() as f64 / total as f64 * 100.0
    }

    /// [1min, 5min, 15min]
    pub fn load_average(&self) -> [f64; 3] {
        let load = System::load_average();
        [load.one, load.five, load.fifteen]
    }

    pub fn disk_usage_percent(&self, path: &Path) -> Result<f64, AccessorError> {
        disk_usage_percent(path)
    }

    pub fn cpu_temperature(&mut self) -> Result<f64, AccessorError> {
        self.components.refresh();

        for wanted in CPU_SENSOR_LABELS {
            if let Some(component) = self
                .components
                .iter()
                .find(|c| c.label().contains(wanted))
            {
                let celsius = f64::from(component.temperature());
                if celsius.is_finite() {
                    return Ok(celsius);
                }
            }
        }

        debug!("No CPU component found, falling back to thermal zone");
        let raw = std::fs::read_to_string(THERMAL_ZONE_TEMP)?;
        raw.trim()
            .parse::<f64>()
            .map(|millidegrees| millidegrees / 1000.0)
            .map_err(|e| AccessorError::Unavailable(format!("unreadable thermal zone: {}", e)))
    }

    pub fn network_totals(&mut self) -> NetworkTotals {
        self.networks.refresh();
        self.networks
            .iter()
            .fold(NetworkTotals { transmitted: 0, received: 0 }, |acc, (_, data)| NetworkTotals {
                transmitted: acc.transmitted + data.total_transmitted(),
                received: acc.received + data.total_received(),
            })
    }

    /// Boot time in the configured timezone, RFC 3339
    pub fn last_boot(&self) -> Result<String, AccessorError> {
        format_timestamp(System::boot_time() as i64, self.timezone)
            .ok_or_else(|| AccessorError::Unavailable("boot time out of range".to_string()))
    }

    /// Current time in the configured timezone, RFC 3339
    pub fn now(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .to_rfc3339_opts(SecondsFormat::Secs, false)
    }

    pub fn hostname(&self) -> String {
        gethostname::gethostname().to_string_lossy().to_string()
    }

    /// Address of the interface used for outbound traffic
    pub fn host_ip(&self) -> String {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string())
    }

    pub fn os_pretty_name(&self) -> String {
        self.os_pretty_name
            .clone()
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn architecture(&self) -> &'static str {
        std::env::consts::ARCH
    }

    pub fn pending_updates(&self) -> Result<usize, AccessorError> {
        let output = run_bounded(
            "apt-get",
            &["-s", "-o", "Debug::NoLocking=true", "upgrade"],
            COMMAND_TIMEOUT,
        )?;
        Ok(count_pending_upgrades(&output))
    }

    /// Link level of the wireless interface in dBm, 0 when there is none
    pub fn wifi_strength(&self) -> i64 {
        std::fs::read_to_string(WIRELESS_PATH)
            .ok()
            .and_then(|content| parse_wireless_level(&content, WIFI_INTERFACE))
            .unwrap_or(0)
    }

    pub fn wifi_ssid(&self) -> String {
        match run_bounded("iwgetid", &["-r"], COMMAND_TIMEOUT) {
            Ok(ssid) if !ssid.is_empty() => ssid,
            Ok(_) => "UNKNOWN".to_string(),
            Err(e) => {
                debug!("iwgetid failed: {}", e);
                "UNKNOWN".to_string()
            }
        }
    }

    pub fn under_voltage(&self) -> Result<bool, AccessorError> {
        let alarm = self
            .under_voltage_alarm
            .as_ref()
            .ok_or_else(|| AccessorError::Unavailable("no under-voltage monitor".to_string()))?;
        Ok(std::fs::read_to_string(alarm)?.trim() == "1")
    }
}

/// PRETTY_NAME from os-release, or `Unknown`
pub fn host_os_name() -> String {
    read_os_pretty_name().unwrap_or_else(|| "Unknown".to_string())
}

fn read_os_pretty_name() -> Option<String> {
    std::fs::read_to_string(OS_RELEASE_PATH)
        .ok()
        .and_then(|content| parse_os_release(&content))
}

/// Mount points currently known to the OS
pub fn mount_points() -> Vec<PathBuf> {
    Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|disk| disk.mount_point().to_path_buf())
        .collect()
}

/// Percentage of the filesystem holding `path` that is in use, as `df` reports it
pub fn disk_usage_percent(path: &Path) -> Result<f64, AccessorError> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let fragment = stat.fragment_size() as u64;
    let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
    let available = stat.blocks_available() as u64 * fragment;

    if used + available == 0 {
        return Err(AccessorError::Unavailable(format!(
            "{} reports no capacity",
            path.display()
        )));
    }
    Ok(used as f64 / (used + available) as f64 * 100.0)
}

/// Path of the `rpi_volt` low-voltage alarm attribute, when the device exists
pub fn locate_under_voltage_alarm() -> Option<PathBuf> {
    let entries = std::fs::read_dir(HWMON_ROOT).ok()?;
    entries
        .flatten()
        .map(|entry| entry.path())
        .find(|dir| {
            std::fs::read_to_string(dir.join("name"))
                .map(|name| name.trim() == "rpi_volt")
                .unwrap_or(false)
        })
        .map(|dir| dir.join("in0_lcrit_alarm"))
}

fn parse_os_release(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|value| value.trim().trim_matches('"').to_string())
    })
}

fn parse_wireless_level(content: &str, interface: &str) -> Option<i64> {
    let prefix = format!("{}:", interface);
    content
        .lines()
        .map(str::split_whitespace)
        .find_map(|mut fields| {
            if fields.next()? != prefix {
                return None;
            }
            // status, link quality, then level ("-52.")
            let level = fields.nth(2)?;
            level.trim_end_matches('.').parse::<f64>().ok().map(|v| v as i64)
        })
}

fn count_pending_upgrades(apt_output: &str) -> usize {
    apt_output
        .lines()
        .filter(|line| line.starts_with("Inst "))
        .count()
}

fn format_timestamp(secs: i64, timezone: Tz) -> Option<String> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|utc| utc.with_timezone(&timezone).to_rfc3339_opts(SecondsFormat::Secs, false))
}
