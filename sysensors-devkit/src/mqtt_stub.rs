/*!
In-memory broker link for tests

[`MockMqttClient`] records every publish and subscription the agent makes.
[`MockEventLoop`] plays back a scripted sequence of connection events, then
delivers whatever the test injects through the client.
*/

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sysensors_agent::session::{EventSource, LinkError, LinkEvent, MqttLink};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

type Injector = mpsc::UnboundedSender<Result<LinkEvent, LinkError>>;

/// Recording stand-in for `rumqttc::AsyncClient`
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    injector: Arc<Mutex<Option<Injector>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event loop replaying `script`, then events injected through this client
    pub fn event_loop(&self, script: Vec<Result<LinkEvent, LinkError>>) -> MockEventLoop {
        let (sender, receiver) = mpsc::unbounded_channel();
        *lock(&self.injector) = Some(sender);
        MockEventLoop {
            script: script.into(),
            injected: receiver,
        }
    }

    /// Push an event into the paired event loop
    pub fn inject(&self, event: Result<LinkEvent, LinkError>) -> Result<()> {
        let guard = lock(&self.injector);
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no event loop attached"))?;
        sender
            .send(event)
            .map_err(|e| anyhow::anyhow!("event loop dropped: {}", e))
    }

    /// Simulate a message arriving from the broker
    pub fn simulate_incoming(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let topic = topic.into();
        debug!("[MOCK] Simulated incoming on {}", topic);
        self.inject(Ok(LinkEvent::Message {
            topic,
            payload: payload.into(),
        }))
    }

    /// Simulate the broker dropping the connection
    pub fn simulate_connection_loss(&self) -> Result<()> {
        self.inject(Err(LinkError::Transient("connection reset by peer".to_string())))
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        lock(&self.published_messages).clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        lock(&self.published_messages)
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn find_messages_by_prefix(&self, prefix: &str) -> Vec<MockMessage> {
        lock(&self.published_messages)
            .iter()
            .filter(|msg| msg.topic.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl MqttLink for MockMqttClient {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), LinkError> {
        debug!("[MOCK] Published to {}: {} bytes", topic, payload.len());
        lock(&self.published_messages).push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), LinkError> {
        debug!("[MOCK] Subscribed to {}", topic);
        lock(&self.subscriptions).push(topic.to_string());
        Ok(())
    }

    /// Mirrors rumqttc: the loop reports the outgoing disconnect once flushed
    fn disconnect(&self) -> Result<(), LinkError> {
        if let Some(sender) = lock(&self.injector).as_ref() {
            let _ = sender.send(Ok(LinkEvent::Closed));
        }
        Ok(())
    }
}

/// Scripted stand-in for `rumqttc::EventLoop`
pub struct MockEventLoop {
    script: VecDeque<Result<LinkEvent, LinkError>>,
    injected: mpsc::UnboundedReceiver<Result<LinkEvent, LinkError>>,
}

#[async_trait]
impl EventSource for MockEventLoop {
    async fn poll(&mut self) -> Result<LinkEvent, LinkError> {
        if let Some(event) = self.script.pop_front() {
            return event;
        }
        match self.injected.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}
