//! Settings loading and validation
//!
//! Handles:
//! - YAML settings file parsing
//! - Required key checks with descriptive errors
//! - Defaults (port, update interval, topic prefixes)
//! - Sensor toggles and external drive declarations

use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Settings file name looked up when no path is given on the command line
pub const DEFAULT_SETTINGS_FILE: &str = "settings.yaml";

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 60;
const DEFAULT_HA_STATUS: &str = "hass";
const DEFAULT_TOPIC_PREFIX: &str = "system-sensors";
const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0} not defined in settings! Please check the documentation")]
    Missing(&'static str),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Validated agent settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Display name as written by the user (e.g. "Living Room Pi")
    pub device_name: String,
    pub client_id: String,
    pub timezone: Tz,
    pub update_interval: Duration,
    /// Prefix the automation platform publishes its own status under
    pub ha_status: String,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub mqtt: MqttSettings,
    pub sensors: SensorSettings,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub hostname: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    pub ca_certs: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
}

/// `sensors:` section: boolean toggles keyed by sensor id, plus external drives
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorSettings {
    #[serde(default)]
    external_drives: Option<BTreeMap<String, PathBuf>>,
    #[serde(flatten)]
    pub toggles: BTreeMap<String, bool>,
}

impl SensorSettings {
    /// Drive label -> mount path, as declared by the user
    pub fn external_drives(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.external_drives
            .iter()
            .flatten()
            .map(|(label, path)| (label.as_str(), path.as_path()))
    }

    /// Explicit user choice for a sensor, if any
    pub fn toggle(&self, id: &str) -> Option<bool> {
        self.toggles.get(id).copied()
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    mqtt: Option<RawMqtt>,
    #[serde(rename = "deviceName", alias = "device_name")]
    device_name: Option<String>,
    client_id: Option<String>,
    timezone: Option<String>,
    update_interval: Option<u64>,
    ha_status: Option<String>,
    topic_prefix: Option<String>,
    discovery_prefix: Option<String>,
    sensors: Option<SensorSettings>,
    power_integer_state: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawMqtt {
    hostname: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    tls: Option<TlsSettings>,
}

impl Settings {
    /// Load and validate settings from a YAML file
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate settings from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawSettings = serde_yaml::from_str(content)?;
        Self::validate(raw)
    }

    /// Settings path used when none is given: next to the executable, else the working directory
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_SETTINGS_FILE)))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE))
    }

    /// Topic-safe device name: spaces removed, lowercased
    pub fn device_slug(&self) -> String {
        self.device_name.replace(' ', "").to_lowercase()
    }

    fn validate(raw: RawSettings) -> Result<Self, ConfigError> {
        let mqtt = raw.mqtt.ok_or(ConfigError::Missing("mqtt"))?;
        let device_name = non_empty(raw.device_name).ok_or(ConfigError::Missing("deviceName"))?;
        let client_id = non_empty(raw.client_id).ok_or(ConfigError::Missing("client_id"))?;
        let timezone_name = non_empty(raw.timezone).ok_or(ConfigError::Missing("timezone"))?;
        let hostname = non_empty(mqtt.hostname).ok_or(ConfigError::Missing("mqtt.hostname"))?;

        if mqtt.user.is_some() && mqtt.password.is_none() {
            return Err(ConfigError::Missing("mqtt.password"));
        }

        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|e| ConfigError::Invalid {
                key: "timezone",
                reason: e.to_string(),
            })?;

        let interval_secs = raw.update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS);
        if interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "update_interval",
                reason: "must be at least one second".to_string(),
            });
        }

        if let Some(tls) = &mqtt.tls {
            if tls.ca_certs.is_none() {
                return Err(ConfigError::Invalid {
                    key: "mqtt.tls",
                    reason: "ca_certs is required when tls is enabled".to_string(),
                });
            }
            if tls.certfile.is_some() != tls.keyfile.is_some() {
                return Err(ConfigError::Invalid {
                    key: "mqtt.tls",
                    reason: "certfile and keyfile must be given together".to_string(),
                });
            }
        }

        if raw.power_integer_state.is_some() {
            warn!(
                "power_integer_state is deprecated, please remove this option: \
                 power state is now a binary sensor"
            );
        }

        Ok(Settings {
            device_name,
            client_id,
            timezone,
            update_interval: Duration::from_secs(interval_secs),
            ha_status: raw.ha_status.unwrap_or_else(|| DEFAULT_HA_STATUS.to_string()),
            topic_prefix: raw
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            discovery_prefix: raw
                .discovery_prefix
                .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            mqtt: MqttSettings {
                hostname,
                port: mqtt.port.unwrap_or(DEFAULT_PORT),
                user: mqtt.user,
                password: mqtt.password,
                tls: mqtt.tls,
            },
            sensors: raw.sensors.unwrap_or_default(),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
mqtt:
  hostname: 192.168.1.10
deviceName: Living Room Pi
client_id: living-room
timezone: Europe/London
"#;

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::from_yaml(MINIMAL).unwrap();
        assert_eq!(settings.mqtt.port, 1883);
        assert_eq!(settings.update_interval, Duration::from_secs(60));
        assert_eq!(settings.ha_status, "hass");
        assert_eq!(settings.topic_prefix, "system-sensors");
        assert_eq!(settings.discovery_prefix, "homeassistant");
        assert_eq!(settings.timezone, chrono_tz::Europe::London);
        assert!(settings.sensors.toggles.is_empty());
    }

    #[test]
    fn test_device_slug() {
        let settings = Settings::from_yaml(MINIMAL).unwrap();
        assert_eq!(settings.device_slug(), "livingroompi");
    }

    #[test]
    fn test_missing_required_keys() {
        let err = Settings::from_yaml("deviceName: x\nclient_id: y\ntimezone: UTC\n").unwrap_err();
        assert!(matches!(err, ConfigError::Missing("mqtt")));

        let err =
            Settings::from_yaml("mqtt:\n  port: 1883\ndeviceName: x\nclient_id: y\ntimezone: UTC\n")
                .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("mqtt.hostname")));
        assert!(err.to_string().contains("mqtt.hostname"));
    }

    #[test]
    fn test_user_requires_password() {
        let yaml = MINIMAL.replace("hostname: 192.168.1.10", "hostname: 192.168.1.10\n  user: pi");
        let err = Settings::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("mqtt.password")));
    }

    #[test]
    fn test_unknown_timezone_rejected() {
        let yaml = MINIMAL.replace("Europe/London", "Mars/Olympus");
        let err = Settings::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "timezone", .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = format!("{MINIMAL}update_interval: 0\n");
        assert!(matches!(
            Settings::from_yaml(&yaml),
            Err(ConfigError::Invalid { key: "update_interval", .. })
        ));
    }

    #[test]
    fn test_sensor_toggles_and_drives() {
        let yaml = format!(
            "{MINIMAL}sensors:\n  temperature: false\n  cpu_usage: true\n  external_drives:\n    Backup: /mnt/backup\n"
        );
        let settings = Settings::from_yaml(&yaml).unwrap();
        assert_eq!(settings.sensors.toggle("temperature"), Some(false));
        assert_eq!(settings.sensors.toggle("cpu_usage"), Some(true));
        assert_eq!(settings.sensors.toggle("memory_use"), None);

        let drives: Vec<_> = settings.sensors.external_drives().collect();
        assert_eq!(drives, vec![("Backup", Path::new("/mnt/backup"))]);
    }

    #[test]
    fn test_empty_external_drives_section() {
        let yaml = format!("{MINIMAL}sensors:\n  external_drives:\n");
        let settings = Settings::from_yaml(&yaml).unwrap();
        assert_eq!(settings.sensors.external_drives().count(), 0);
    }

    #[test]
    fn test_tls_requires_cert_and_key_together() {
        let yaml = MINIMAL.replace(
            "hostname: 192.168.1.10",
            "hostname: 192.168.1.10\n  tls:\n    ca_certs: /etc/ssl/ca.pem\n    certfile: /etc/ssl/client.pem",
        );
        assert!(matches!(
            Settings::from_yaml(&yaml),
            Err(ConfigError::Invalid { key: "mqtt.tls", .. })
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::load(file.path()).await.unwrap();
        assert_eq!(settings.client_id, "living-room");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Settings::load(Path::new("/nonexistent/settings.yaml")).await.unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
