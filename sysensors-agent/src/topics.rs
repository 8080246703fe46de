//! Topic namespace of one device

use crate::config::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// `{ns}/sensor/{device}/state`
    pub state: String,
    /// `{ns}/sensor/{device}/availability`, also the last will
    pub availability: String,
    /// `{ns}/sensor/{device}/command`
    pub command: String,
    /// `{ha_status}/status`
    pub platform_status: String,
    discovery_prefix: String,
    device: String,
}

impl Topics {
    pub fn new(topic_prefix: &str, discovery_prefix: &str, ha_status: &str, device: &str) -> Self {
        let base = format!("{}/sensor/{}", topic_prefix, device);
        Self {
            state: format!("{}/state", base),
            availability: format!("{}/availability", base),
            command: format!("{}/command", base),
            platform_status: format!("{}/status", ha_status),
            discovery_prefix: discovery_prefix.to_string(),
            device: device.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.topic_prefix,
            &settings.discovery_prefix,
            &settings.ha_status,
            &settings.device_slug(),
        )
    }

    /// `{discovery_prefix}/{component}/{device}/{sensor_id}/config`
    pub fn discovery_config(&self, component: &str, sensor_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix, component, self.device, sensor_id
        )
    }

    /// Topics the session subscribes to on every connect
    pub fn subscriptions(&self) -> [&str; 2] {
        [&self.platform_status, &self.command]
    }
}
