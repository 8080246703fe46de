/*!
Test harness for agent integration tests

- Settings fixtures with a minimal valid configuration
- Waiting for published messages with a timeout
- Expectations on per-topic message counts
*/

use crate::mqtt_stub::{MockMessage, MockMqttClient};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use sysensors_agent::Settings;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Minimal settings for device `Test Pi` (slug `testpi`), plus `extra` YAML
pub fn test_settings(extra: &str) -> Result<Settings> {
    let yaml = format!(
        "mqtt:\n  hostname: localhost\ndeviceName: Test Pi\nclient_id: test-pi\ntimezone: UTC\n{}",
        extra
    );
    Ok(Settings::from_yaml(&yaml)?)
}

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new(mqtt_client: MockMqttClient) -> Self {
        init_tracing();
        Self {
            mqtt_client,
            expectations: Vec::new(),
        }
    }

    /// Expect exactly `count` messages on `topic`
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Wait until at least `count` messages were published on `topic`
    pub async fn wait_for_count(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<MockMessage>> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let messages = self.mqtt_client.find_messages_by_topic(topic);
                if messages.len() >= count {
                    return messages;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;

        match outcome {
            Ok(messages) => Ok(messages),
            Err(_) => {
                warn!("Timeout waiting for {} messages on {}", count, topic);
                anyhow::bail!(
                    "expected {} messages on '{}', got {}",
                    count,
                    topic,
                    self.mqtt_client.find_messages_by_topic(topic).len()
                )
            }
        }
    }

    /// Wait for the first message on `topic` and parse it as JSON
    pub async fn wait_for_message(&self, topic: &str, timeout: Duration) -> Result<Value> {
        let messages = self.wait_for_count(topic, 1, timeout).await?;
        messages[0].json()
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
            info!("Topic '{}': {} messages as expected", expectation.topic, actual_count);
        }
        Ok(())
    }

    /// Payloads published on `topic`, as text, in order
    pub fn texts(&self, topic: &str) -> Vec<String> {
        self.mqtt_client
            .find_messages_by_topic(topic)
            .iter()
            .map(MockMessage::text)
            .collect()
    }

    /// Index of the first publish on `topic`, in overall publish order
    pub fn first_index(&self, topic: &str) -> Option<usize> {
        self.mqtt_client
            .get_published_messages()
            .iter()
            .position(|msg| msg.topic == topic)
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.mqtt_client.get_subscriptions(),
        }
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}
