//! Discovery announcements
//!
//! Every enabled sensor is described to the automation platform by one
//! retained config message. All sensors of a host share a device block so
//! they group under a single device. Payloads are built from typed structs
//! with a fixed field order, so re-announcing produces byte-identical
//! messages.

use crate::sensors::SensorDefinition;
use crate::session::{BrokerSession, Delivery, MqttLink};
use crate::topics::Topics;
use rumqttc::QoS;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

const MANUFACTURER: &str = "System Sensors";

/// Identity shared by every sensor of this host
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Topic-safe name, e.g. `livingroompi`
    pub slug: String,
    /// Name as configured, e.g. `Living Room Pi`
    pub display_name: String,
    pub model: String,
    pub manufacturer: String,
    pub sw_version: String,
}

impl DeviceIdentity {
    pub fn new(
        slug: impl Into<String>,
        display_name: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            display_name: display_name.into(),
            model: model.into(),
            manufacturer: MANUFACTURER.to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DeviceBlock<'a> {
    identifiers: [String; 1],
    name: String,
    model: &'a str,
    manufacturer: &'a str,
    sw_version: &'a str,
}

#[derive(Debug, Serialize)]
struct SensorConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    name: String,
    state_topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    value_template: String,
    unique_id: String,
    availability_topic: &'a str,
    device: DeviceBlock<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
    #[serde(flatten)]
    extra: &'a BTreeMap<String, Value>,
}

pub struct DiscoveryPublisher {
    identity: DeviceIdentity,
    topics: Topics,
}

impl DiscoveryPublisher {
    pub fn new(identity: DeviceIdentity, topics: Topics) -> Self {
        Self { identity, topics }
    }

    /// `{device}_{component}_{sensor_id}`
    pub fn unique_id(&self, sensor: &SensorDefinition) -> String {
        format!(
            "{}_{}_{}",
            self.identity.slug,
            sensor.category.component(),
            sensor.id
        )
    }

    /// Config topic and serialized payload for one sensor
    pub fn config_message(
        &self,
        sensor: &SensorDefinition,
    ) -> Result<(String, Vec<u8>), serde_json::Error> {
        let component = sensor.category.component();
        let config = SensorConfig {
            device_class: sensor.device_class.as_deref(),
            name: format!("{} {}", self.identity.display_name, sensor.display_name),
            state_topic: &self.topics.state,
            unit_of_measurement: sensor.unit.as_deref(),
            value_template: format!("{{{{value_json.{}}}}}", sensor.id),
            unique_id: self.unique_id(sensor),
            availability_topic: &self.topics.availability,
            device: DeviceBlock {
                identifiers: [format!("{}_sensor", self.identity.slug)],
                name: format!("{} Sensors", self.identity.display_name),
                model: &self.identity.model,
                manufacturer: &self.identity.manufacturer,
                sw_version: &self.identity.sw_version,
            },
            icon: sensor.icon.as_ref().map(|icon| format!("mdi:{}", icon)),
            extra: &sensor.extra,
        };

        let payload = serde_json::to_vec(&config)?;
        Ok((self.topics.discovery_config(component, &sensor.id), payload))
    }

    /// Publish one config per sensor, then `online`; returns how many configs were sent
    pub fn announce<L: MqttLink>(
        &self,
        session: &BrokerSession<L>,
        sensors: &[&SensorDefinition],
    ) -> usize {
        let mut announced = 0;

        for sensor in sensors {
            let (topic, payload) = match self.config_message(sensor) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Failed to encode discovery for `{}`: {}", sensor.id, e);
                    continue;
                }
            };

            if session.publish(&topic, payload, QoS::AtLeastOnce, true) == Delivery::Sent {
                announced += 1;
            }
        }

        session.publish(&self.topics.availability, "online", QoS::AtLeastOnce, true);
        info!("Announced {}/{} sensors", announced, sensors.len());

        announced
    }
}
