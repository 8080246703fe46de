//! Full agent runs against the devkit's in-memory broker link

use std::time::Duration;
use sysensors_agent::sensors::{EnablementMap, SensorDefinition, SensorRegistry, SensorValue};
use sysensors_agent::session::{LinkError, LinkEvent, SessionError};
use sysensors_agent::{Agent, AgentError};
use sysensors_devkit::{test_settings, MockEventLoop, MockMqttClient, TestHarness};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STATE: &str = "system-sensors/sensor/testpi/state";
const AVAILABILITY: &str = "system-sensors/sensor/testpi/availability";
const DISCOVERY: &str = "homeassistant/";
const WAIT: Duration = Duration::from_secs(5);

type AgentTask = JoinHandle<Result<(), AgentError>>;

fn start(agent: Agent<MockMqttClient, MockEventLoop>) -> (CancellationToken, AgentTask) {
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(agent.run(shutdown.clone()));
    (shutdown, task)
}

fn constant_sensors(ids: &[&str]) -> (SensorRegistry, EnablementMap) {
    let mut registry = SensorRegistry::new();
    for id in ids {
        registry
            .register(SensorDefinition::measurement(*id, *id, |_| Ok(SensorValue::Integer(1))))
            .unwrap();
    }
    let enablement = EnablementMap::only(&registry, ids.iter().copied());
    (registry, enablement)
}

#[tokio::test]
async fn test_only_enabled_sensors_are_published() {
    let registry = SensorRegistry::with_builtin().unwrap();
    let toggles: String = registry
        .ids()
        .map(|id| format!("  {}: {}\n", id, matches!(id, "cpu_usage" | "memory_use")))
        .collect();
    let settings = test_settings(&format!("sensors:\n{}", toggles)).unwrap();
    let enablement = EnablementMap::build(&registry, &settings.sensors, &[]);

    let client = MockMqttClient::new();
    let events = client.event_loop(vec![Ok(LinkEvent::Connected)]);
    let harness = TestHarness::new(client.clone());
    let (shutdown, task) = start(
        Agent::new(settings, client.clone(), events).with_sensors(registry, enablement),
    );

    let state = harness.wait_for_message(STATE, WAIT).await.unwrap();
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let configs = client.find_messages_by_prefix(DISCOVERY);
    let config_topics: Vec<_> = configs.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(
        config_topics,
        vec![
            "homeassistant/sensor/testpi/memory_use/config",
            "homeassistant/sensor/testpi/cpu_usage/config",
        ]
    );
    assert!(configs.iter().all(|m| m.retain));

    let state = state.as_object().unwrap();
    assert_eq!(state.len(), 2);
    assert!(state.contains_key("cpu_usage"));
    assert!(state.contains_key("memory_use"));
    assert_eq!(client.find_messages_by_topic(STATE).len(), 1);

    assert_eq!(harness.texts(AVAILABILITY), vec!["online", "offline"]);
    let online = harness.first_index(AVAILABILITY).unwrap();
    let last_config = harness
        .first_index("homeassistant/sensor/testpi/cpu_usage/config")
        .unwrap();
    assert!(online > last_config);
    assert!(harness.first_index(STATE).unwrap() > online);

    assert_eq!(
        client.get_subscriptions(),
        vec!["hass/status", "system-sensors/sensor/testpi/command"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connects_after_two_failures() {
    let settings = test_settings("").unwrap();
    let (registry, enablement) = constant_sensors(&["cpu_usage"]);

    let client = MockMqttClient::new();
    let refused = || Err(LinkError::Transient("connection refused".to_string()));
    let events = client.event_loop(vec![refused(), refused(), Ok(LinkEvent::Connected)]);
    let harness = TestHarness::new(client.clone());

    let started = tokio::time::Instant::now();
    let (shutdown, task) = start(
        Agent::new(settings, client.clone(), events)
            .with_sensors(registry, enablement)
            .with_retry_interval(Duration::from_secs(10)),
    );

    harness
        .wait_for_count(AVAILABILITY, 1, Duration::from_secs(120))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(20));

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(harness.texts(AVAILABILITY), vec!["online", "offline"]);
}

#[tokio::test]
async fn test_nothing_published_while_disconnected() {
    let settings = test_settings("").unwrap();
    let (registry, enablement) = constant_sensors(&["cpu_usage"]);

    let client = MockMqttClient::new();
    let events = client.event_loop(vec![Err(LinkError::Transient(
        "network unreachable".to_string(),
    ))]);
    let (shutdown, task) = start(
        Agent::new(settings, client.clone(), events)
            .with_sensors(registry, enablement)
            .with_retry_interval(Duration::from_secs(600)),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    // Shutdown must not wait out the retry interval
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert!(client.get_published_messages().is_empty());
}

#[tokio::test]
async fn test_authentication_failure_is_fatal() {
    let settings = test_settings("").unwrap();
    let (registry, enablement) = constant_sensors(&["cpu_usage"]);

    let client = MockMqttClient::new();
    let events = client.event_loop(vec![Err(LinkError::Unauthorized(
        "NotAuthorized".to_string(),
    ))]);
    let (_shutdown, task) = start(
        Agent::new(settings, client.clone(), events).with_sensors(registry, enablement),
    );

    let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(AgentError::Session(SessionError::Unauthorized(_)))
    ));
    assert!(client.get_published_messages().is_empty());
}

#[tokio::test]
async fn test_platform_restart_triggers_identical_reannouncement() {
    let settings = test_settings("").unwrap();
    let (registry, enablement) = constant_sensors(&["cpu_usage", "memory_use"]);

    let client = MockMqttClient::new();
    let events = client.event_loop(vec![Ok(LinkEvent::Connected)]);
    let harness = TestHarness::new(client.clone());
    let (shutdown, task) = start(
        Agent::new(settings, client.clone(), events).with_sensors(registry, enablement),
    );

    harness.wait_for_count(STATE, 1, WAIT).await.unwrap();
    client.simulate_incoming("hass/status", "online").unwrap();

    let config_topic = "homeassistant/sensor/testpi/memory_use/config";
    let announcements = harness.wait_for_count(config_topic, 2, WAIT).await.unwrap();
    assert_eq!(announcements[0].payload, announcements[1].payload);

    // "offline" is ignored; only the refresh command announces a third time
    client.simulate_incoming("hass/status", "offline").unwrap();
    client
        .simulate_incoming("system-sensors/sensor/testpi/command", "refresh")
        .unwrap();
    harness.wait_for_count(config_topic, 3, WAIT).await.unwrap();

    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(client.find_messages_by_topic(config_topic).len(), 3);
    // Re-announcement does not publish an extra state message
    assert_eq!(client.find_messages_by_topic(STATE).len(), 1);
}

#[tokio::test]
async fn test_reconnect_reannounces_and_publishes_state() {
    let settings = test_settings("").unwrap();
    let (registry, enablement) = constant_sensors(&["cpu_usage"]);

    let client = MockMqttClient::new();
    let events = client.event_loop(vec![Ok(LinkEvent::Connected)]);
    let harness = TestHarness::new(client.clone());
    let (shutdown, task) = start(
        Agent::new(settings, client.clone(), events)
            .with_sensors(registry, enablement)
            .with_retry_interval(Duration::from_millis(20)),
    );

    harness.wait_for_count(STATE, 1, WAIT).await.unwrap();
    client.simulate_connection_loss().unwrap();
    client.inject(Ok(LinkEvent::Connected)).unwrap();

    let states = harness.wait_for_count(STATE, 2, WAIT).await.unwrap();
    assert_eq!(states[1].json().unwrap()["cpu_usage"], 1);

    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(
        client
            .find_messages_by_topic("homeassistant/sensor/testpi/cpu_usage/config")
            .len(),
        2
    );
    assert_eq!(harness.texts(AVAILABILITY), vec!["online", "online", "offline"]);
}

#[tokio::test]
async fn test_shutdown_lets_running_cycle_finish() {
    let settings = test_settings("").unwrap();
    let mut registry = SensorRegistry::new();
    registry
        .register(SensorDefinition::measurement("slow", "Slow", |_| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(SensorValue::Integer(7))
        }))
        .unwrap();
    let enablement = EnablementMap::only(&registry, ["slow"]);

    let client = MockMqttClient::new();
    let events = client.event_loop(vec![Ok(LinkEvent::Connected)]);
    let harness = TestHarness::new(client.clone());
    let (shutdown, task) = start(
        Agent::new(settings, client.clone(), events).with_sensors(registry, enablement),
    );

    // `online` goes out right before the first cycle starts reading
    harness.wait_for_count(AVAILABILITY, 1, WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.find_messages_by_topic(STATE).is_empty());
    shutdown.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    let published = client.get_published_messages();
    let tail: Vec<_> = published[published.len() - 2..]
        .iter()
        .map(|msg| (msg.topic.as_str(), msg.text()))
        .collect();
    assert_eq!(
        tail,
        vec![
            (STATE, r#"{"slow":7}"#.to_string()),
            (AVAILABILITY, "offline".to_string()),
        ]
    );
}
