//! Sensor registry
//!
//! Every pollable value is described by a [`SensorDefinition`]: display
//! metadata plus an [`Accessor`] that reads the current value. Definitions are
//! collected at startup into an append-only [`SensorRegistry`]; an
//! [`EnablementMap`] decides which of them take part in discovery and state
//! publishing.

pub mod catalog;
pub mod drives;

use crate::capabilities::CapabilityInfo;
use crate::config::SensorSettings;
use crate::facts::HostFacts;
use crate::rate::RateTracker;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub use crate::facts::AccessorError;

/// Discovery component a sensor is announced as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCategory {
    Measurement,
    Binary,
    Switch,
}

impl SensorCategory {
    pub fn component(self) -> &'static str {
        match self {
            SensorCategory::Measurement => "sensor",
            SensorCategory::Binary => "binary_sensor",
            SensorCategory::Switch => "switch",
        }
    }
}

/// A single reading, formatted for the state payload
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    /// Published as a decimal string with exactly `decimals` places
    Fixed { value: f64, decimals: u32 },
    Integer(i64),
    Text(String),
    /// Published as `ON` / `OFF`
    Flag(bool),
}

impl SensorValue {
    pub fn fixed(value: impl Into<f64>, decimals: u32) -> Self {
        SensorValue::Fixed {
            value: value.into(),
            decimals,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        SensorValue::Text(value.into())
    }

    pub fn to_json(&self) -> Result<Value, AccessorError> {
        match self {
            SensorValue::Fixed { value, decimals } => {
                if !value.is_finite() {
                    return Err(AccessorError::NonFinite);
                }
                let scale = 10f64.powi(*decimals as i32);
                let rounded = (value * scale).round() / scale;
                Ok(Value::String(format!("{:.*}", *decimals as usize, rounded)))
            }
            SensorValue::Integer(value) => Ok(Value::from(*value)),
            SensorValue::Text(value) => Ok(Value::String(value.clone())),
            SensorValue::Flag(on) => Ok(Value::String(if *on { "ON" } else { "OFF" }.to_string())),
        }
    }
}

/// State threaded through every accessor call of a poll cycle
pub struct PollContext {
    pub facts: HostFacts,
    pub rates: RateTracker,
}

impl PollContext {
    pub fn new(facts: HostFacts) -> Self {
        Self {
            facts,
            rates: RateTracker::new(),
        }
    }
}

/// Reads the current value of one sensor
pub trait Accessor: Send + Sync {
    fn read(&self, ctx: &mut PollContext) -> Result<SensorValue, AccessorError>;
}

impl<F> Accessor for F
where
    F: Fn(&mut PollContext) -> Result<SensorValue, AccessorError> + Send + Sync,
{
    fn read(&self, ctx: &mut PollContext) -> Result<SensorValue, AccessorError> {
        self(ctx)
    }
}

/// Discovery fields filled in from the definition itself; `extra` cannot override them
pub const RESERVED_DISCOVERY_KEYS: &[&str] = &[
    "availability_topic",
    "device",
    "device_class",
    "icon",
    "name",
    "state_topic",
    "unique_id",
    "unit_of_measurement",
    "value_template",
];

/// Immutable description of one sensor
#[derive(Clone)]
pub struct SensorDefinition {
    pub id: String,
    pub display_name: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
    /// Material Design icon name, without the `mdi:` prefix
    pub icon: Option<String>,
    pub category: SensorCategory,
    pub accessor: Arc<dyn Accessor>,
    /// Additional discovery fields merged into the config payload
    pub extra: BTreeMap<String, Value>,
}

impl SensorDefinition {
    pub fn new<F>(
        id: impl Into<String>,
        display_name: impl Into<String>,
        category: SensorCategory,
        accessor: F,
    ) -> Self
    where
        F: Fn(&mut PollContext) -> Result<SensorValue, AccessorError> + Send + Sync + 'static,
    {
        let mut extra = BTreeMap::new();
        if category == SensorCategory::Binary {
            extra.insert("payload_on".to_string(), Value::from("ON"));
            extra.insert("payload_off".to_string(), Value::from("OFF"));
        }

        Self {
            id: id.into(),
            display_name: display_name.into(),
            unit: None,
            device_class: None,
            icon: None,
            category,
            accessor: Arc::new(accessor),
            extra,
        }
    }

    pub fn measurement<F>(
        id: impl Into<String>,
        display_name: impl Into<String>,
        accessor: F,
    ) -> Self
    where
        F: Fn(&mut PollContext) -> Result<SensorValue, AccessorError> + Send + Sync + 'static,
    {
        Self::new(id, display_name, SensorCategory::Measurement, accessor)
    }

    pub fn binary<F>(id: impl Into<String>, display_name: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&mut PollContext) -> Result<SensorValue, AccessorError> + Send + Sync + 'static,
    {
        Self::new(id, display_name, SensorCategory::Binary, accessor)
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn device_class(mut self, class: impl Into<String>) -> Self {
        self.device_class = Some(class.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if RESERVED_DISCOVERY_KEYS.contains(&key.as_str()) {
            warn!("Ignoring extra field `{}` on sensor `{}`", key, self.id);
            return self;
        }
        self.extra.insert(key, value.into());
        self
    }

    pub fn read(&self, ctx: &mut PollContext) -> Result<SensorValue, AccessorError> {
        self.accessor.read(ctx)
    }
}

impl fmt::Debug for SensorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorDefinition")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("unit", &self.unit)
            .field("device_class", &self.device_class)
            .field("icon", &self.icon)
            .field("category", &self.category)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
#[error("sensor `{id}` is already registered")]
pub struct DuplicateSensorError {
    pub id: String,
}

/// Append-only, ordered set of sensor definitions
#[derive(Debug, Default)]
pub struct SensorRegistry {
    sensors: Vec<SensorDefinition>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-filled with the built-in host sensors
    pub fn with_builtin() -> Result<Self, DuplicateSensorError> {
        let mut registry = Self::new();
        for definition in catalog::builtin() {
            registry.register(definition)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: SensorDefinition) -> Result<(), DuplicateSensorError> {
        if self.contains(&definition.id) {
            return Err(DuplicateSensorError { id: definition.id });
        }
        self.sensors.push(definition);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sensors.iter().any(|s| s.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&SensorDefinition> {
        self.sensors.iter().find(|s| s.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sensors.iter().map(|s| s.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Enabled sensors, in registration order
    pub fn resolve(&self, enablement: &EnablementMap) -> Vec<&SensorDefinition> {
        self.sensors
            .iter()
            .filter(|s| enablement.is_enabled(&s.id))
            .collect()
    }
}

/// Which registered sensors are active
#[derive(Debug, Clone, Default)]
pub struct EnablementMap {
    enabled: HashMap<String, bool>,
}

impl EnablementMap {
    /// Merge registry ids with user toggles; missing toggles default to enabled
    ///
    /// Sensors whose capability is unavailable on this host are forced off.
    pub fn build(
        registry: &SensorRegistry,
        settings: &SensorSettings,
        capabilities: &[CapabilityInfo],
    ) -> Self {
        let mut enabled: HashMap<String, bool> = registry
            .ids()
            .map(|id| (id.to_string(), settings.toggle(id).unwrap_or(true)))
            .collect();

        for (id, _) in &settings.toggles {
            if !registry.contains(id) {
                warn!("Unknown sensor `{}` in settings, ignoring", id);
            }
        }

        for capability in capabilities.iter().filter(|c| !c.available) {
            let id = capability.capability_type.gated_sensor();
            if settings.toggle(id) == Some(true) {
                warn!(
                    "{}",
                    capability
                        .reason
                        .as_deref()
                        .unwrap_or("capability unavailable")
                );
            }
            if let Some(flag) = enabled.get_mut(id) {
                *flag = false;
            }
        }

        Self { enabled }
    }

    /// Enable exactly the given ids, everything else off
    pub fn only<'a>(registry: &SensorRegistry, ids: impl IntoIterator<Item = &'a str>) -> Self {
        let wanted: Vec<&str> = ids.into_iter().collect();
        Self {
            enabled: registry
                .ids()
                .map(|id| (id.to_string(), wanted.contains(&id)))
                .collect(),
        }
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.enabled.get(id).copied().unwrap_or(false)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.values().filter(|on| **on).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityType;

    fn constant(id: &str, value: i64) -> SensorDefinition {
        SensorDefinition::measurement(id, id.to_uppercase(), move |_| {
            Ok(SensorValue::Integer(value))
        })
    }

    fn registry(ids: &[&str]) -> SensorRegistry {
        let mut registry = SensorRegistry::new();
        for (i, id) in ids.iter().enumerate() {
            registry.register(constant(id, i as i64)).unwrap();
        }
        registry
    }

    fn sensor_settings(yaml: &str) -> SensorSettings {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = registry(&["cpu_usage"]);
        let err = registry.register(constant("cpu_usage", 9)).unwrap_err();
        assert_eq!(err.id, "cpu_usage");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_keeps_registration_order() {
        let registry = registry(&["zeta", "alpha", "mid"]);
        let enablement = EnablementMap::build(&registry, &SensorSettings::default(), &[]);

        let ids: Vec<_> = registry.resolve(&enablement).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_disabled_sensor_not_resolved() {
        let registry = registry(&["cpu_usage", "temperature", "memory_use"]);
        let settings = sensor_settings("temperature: false\nmemory_use: true\n");
        let enablement = EnablementMap::build(&registry, &settings, &[]);

        let ids: Vec<_> = registry.resolve(&enablement).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["cpu_usage", "memory_use"]);
        assert_eq!(enablement.enabled_count(), 2);
    }

    #[test]
    fn test_unavailable_capability_forces_disabled() {
        let registry = registry(&["power_status", "updates", "hostname"]);
        let settings = sensor_settings("power_status: true\n");
        let capabilities = vec![
            CapabilityInfo::unavailable(CapabilityType::PowerMonitor, "no monitor"),
            CapabilityInfo::available(CapabilityType::PackageUpdates),
        ];
        let enablement = EnablementMap::build(&registry, &settings, &capabilities);

        assert!(!enablement.is_enabled("power_status"));
        assert!(enablement.is_enabled("updates"));
        assert!(enablement.is_enabled("hostname"));
    }

    #[test]
    fn test_unknown_ids_are_disabled() {
        let registry = registry(&["cpu_usage"]);
        let settings = sensor_settings("not_a_sensor: true\n");
        let enablement = EnablementMap::build(&registry, &settings, &[]);

        assert!(!enablement.is_enabled("not_a_sensor"));
        assert!(enablement.is_enabled("cpu_usage"));
    }

    #[test]
    fn test_only() {
        let registry = registry(&["a", "b", "c"]);
        let enablement = EnablementMap::only(&registry, ["c", "a"]);
        let ids: Vec<_> = registry.resolve(&enablement).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_value_formatting() {
        assert_eq!(SensorValue::fixed(0.78125, 2).to_json().unwrap(), Value::from("0.78"));
        assert_eq!(SensorValue::fixed(45.06_f32, 1).to_json().unwrap(), Value::from("45.1"));
        assert_eq!(SensorValue::fixed(0.5, 2).to_json().unwrap(), Value::from("0.50"));
        assert_eq!(SensorValue::fixed(1.0, 2).to_json().unwrap(), Value::from("1.00"));
        assert_eq!(SensorValue::fixed(40, 1).to_json().unwrap(), Value::from("40.0"));
        assert_eq!(SensorValue::Integer(-52).to_json().unwrap(), Value::from(-52));
        assert_eq!(SensorValue::Flag(true).to_json().unwrap(), Value::from("ON"));
        assert_eq!(SensorValue::Flag(false).to_json().unwrap(), Value::from("OFF"));
        assert_eq!(SensorValue::text("pi").to_json().unwrap(), Value::from("pi"));
        assert!(matches!(
            SensorValue::fixed(f64::NAN, 1).to_json(),
            Err(AccessorError::NonFinite)
        ));
    }

    #[test]
    fn test_binary_sensor_payload_extras() {
        let sensor = SensorDefinition::binary("power_status", "Under Voltage", |_| {
            Ok(SensorValue::Flag(false))
        });
        assert_eq!(sensor.extra.get("payload_on"), Some(&Value::from("ON")));
        assert_eq!(sensor.extra.get("payload_off"), Some(&Value::from("OFF")));
        assert_eq!(sensor.category.component(), "binary_sensor");
    }

    #[test]
    fn test_extra_cannot_shadow_builtin_fields() {
        let sensor = constant("cpu_usage", 1)
            .extra("name", "Shadow")
            .extra("unique_id", "other")
            .extra("expire_after", 180);
        assert!(!sensor.extra.contains_key("name"));
        assert!(!sensor.extra.contains_key("unique_id"));
        assert_eq!(sensor.extra.get("expire_after"), Some(&Value::from(180)));
    }
}
