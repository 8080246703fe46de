//! State payload composition
//!
//! One poll cycle reads every enabled sensor and folds the results into a
//! flat JSON object keyed by sensor id. A failing or panicking accessor only
//! costs its own field.

use crate::sensors::{AccessorError, PollContext, SensorDefinition};
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

/// Read `sensors` and return the state object plus the number of failed reads
pub fn build(sensors: &[&SensorDefinition], ctx: &mut PollContext) -> (Map<String, Value>, usize) {
    let mut payload = Map::new();
    let mut failed = 0;

    for sensor in sensors {
        match read_isolated(sensor, ctx) {
            Ok(value) => {
                payload.insert(sensor.id.clone(), value);
            }
            Err(e) => {
                warn!("Sensor `{}` failed: {}", sensor.id, e);
                failed += 1;
            }
        }
    }

    (payload, failed)
}

fn read_isolated(sensor: &SensorDefinition, ctx: &mut PollContext) -> Result<Value, AccessorError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| sensor.read(ctx)));
    match outcome {
        Ok(reading) => reading?.to_json(),
        Err(panic) => Err(AccessorError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::HostFacts;
    use crate::sensors::{EnablementMap, SensorRegistry, SensorValue};

    fn context() -> PollContext {
        PollContext::new(HostFacts::new(chrono_tz::UTC))
    }

    fn ok(id: &str, value: f64) -> SensorDefinition {
        SensorDefinition::measurement(id, id, move |_| Ok(SensorValue::fixed(value, 1)))
    }

    fn failing(id: &str) -> SensorDefinition {
        SensorDefinition::measurement(id, id, |_| {
            Err(AccessorError::Unavailable("not here".to_string()))
        })
    }

    #[test]
    fn test_one_field_per_sensor() {
        let sensors = [ok("cpu_usage", 12.34), ok("memory_use", 50.0)];
        let refs: Vec<_> = sensors.iter().collect();

        let (payload, failed) = build(&refs, &mut context());

        assert_eq!(failed, 0);
        assert_eq!(payload.len(), 2);
        assert_eq!(payload["cpu_usage"], Value::from("12.3"));
        assert_eq!(payload["memory_use"], Value::from("50.0"));
    }

    #[test]
    fn test_failures_are_isolated_and_counted() {
        let sensors = [
            ok("a", 1.0),
            failing("b"),
            ok("c", 3.0),
            SensorDefinition::measurement("d", "d", |_| panic!("accessor blew up")),
            SensorDefinition::measurement("e", "e", |_| Ok(SensorValue::fixed(f64::INFINITY, 1))),
        ];
        let refs: Vec<_> = sensors.iter().collect();

        let (payload, failed) = build(&refs, &mut context());

        assert_eq!(failed, 3);
        assert_eq!(payload.len(), sensors.len() - failed);
        assert!(payload.contains_key("a"));
        assert!(payload.contains_key("c"));
        assert!(!payload.contains_key("b"));
        assert!(!payload.contains_key("d"));
    }

    #[test]
    fn test_disabled_sensor_absent() {
        let mut registry = SensorRegistry::new();
        registry.register(ok("cpu_usage", 1.0)).unwrap();
        registry.register(ok("temperature", 40.0)).unwrap();
        let enablement = EnablementMap::only(&registry, ["cpu_usage"]);

        let (payload, _) = build(&registry.resolve(&enablement), &mut context());

        assert_eq!(payload.keys().collect::<Vec<_>>(), vec!["cpu_usage"]);
    }

    #[test]
    fn test_rate_sensor_uses_shared_tracker() {
        let sensor = SensorDefinition::measurement("net_tx", "Upload", |ctx| {
            Ok(SensorValue::fixed(
                ctx.rates.sample("net_tx", 1024, std::time::Instant::now()),
                2,
            ))
        });
        let mut ctx = context();

        let (payload, _) = build(&[&sensor], &mut ctx);
        assert_eq!(payload["net_tx"], Value::from("0.00"));

        // Second sample sees the baseline stored by the first
        let (payload, _) = build(&[&sensor], &mut ctx);
        assert_eq!(payload["net_tx"], Value::from("0.00"));
    }
}
