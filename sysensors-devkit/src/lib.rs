/*!
# System Sensors DevKit

Test support for the agent, without a running broker:
- In-memory MQTT link recording every publish
- Scripted event loop for connection and control events
- Harness for waiting on and asserting published messages
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockEventLoop, MockMessage, MockMqttClient};
pub use test_utils::{test_settings, TestHarness};
