//! Broker session
//!
//! The session is split in two halves:
//! - [`BrokerSession`]: cheap handle used by the controller to publish. Publishes
//!   are skipped while the session is not connected and never block.
//! - [`SessionDriver`]: task owning the inbound event stream. It tracks the
//!   connection state, retries failed connections after a fixed interval,
//!   subscribes to the control topics and asks for re-announcement.
//!
//! State flows from the driver to the handle through a `watch` channel;
//! announcement requests flow through an unbounded `mpsc` channel.

pub mod link;

pub use link::{EventSource, LinkError, LinkEvent, MqttLink};

use crate::topics::Topics;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between failed connection attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on flushing queued requests after a stop
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why discovery should be (re)sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceReason {
    /// Session (re)established
    Connected,
    /// Automation platform announced it came online
    PlatformOnline,
    /// Refresh requested on the command topic
    RefreshRequested,
}

/// Outcome of a publish request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Not connected, nothing was queued
    Skipped,
    Failed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("broker refused credentials: {0}")]
    Unauthorized(String),

    #[error("session driver stopped")]
    DriverStopped,

    #[error("cancelled while waiting for the broker")]
    Cancelled,
}

/// Reconnect counter and last broker error
#[derive(Debug, Default)]
pub struct SessionHealth {
    reconnects: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl SessionHealth {
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, error: &LinkError) {
        *self.last_error.lock() = Some(error.to_string());
    }
}

/// Publishing handle shared by the controller
pub struct BrokerSession<L> {
    link: L,
    state: watch::Receiver<SessionState>,
    health: Arc<SessionHealth>,
}

impl<L: MqttLink> BrokerSession<L> {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn health(&self) -> &SessionHealth {
        &self.health
    }

    /// Queue a publish if connected; otherwise skip it
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Delivery {
        if !self.is_connected() {
            debug!("Not connected, skipping publish to {}", topic);
            return Delivery::Skipped;
        }

        match self.link.publish(topic, qos, retain, payload.into()) {
            Ok(()) => Delivery::Sent,
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                Delivery::Failed
            }
        }
    }

    /// Block until the driver reports a connection, or `shutdown` fires
    pub async fn wait_connected(&self, shutdown: &CancellationToken) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        tokio::select! {
            _ = shutdown.cancelled() => Err(SessionError::Cancelled),
            result = state.wait_for(|s| *s == SessionState::Connected) => {
                result.map(|_| ()).map_err(|_| SessionError::DriverStopped)
            }
        }
    }

    /// Ask the client to disconnect after flushing queued requests
    pub fn close(&self) {
        if let Err(e) = self.link.disconnect() {
            warn!("Failed to request disconnect: {}", e);
        }
    }
}

/// Inbound half of the session, run as its own task
pub struct SessionDriver<E, L> {
    events: E,
    link: L,
    state: watch::Sender<SessionState>,
    health: Arc<SessionHealth>,
    announce: mpsc::UnboundedSender<AnnounceReason>,
    topics: Topics,
    retry_interval: Duration,
    ever_connected: bool,
}

/// Build both halves of a session around `link` and `events`
pub fn open<E, L>(
    link: L,
    events: E,
    topics: Topics,
    retry_interval: Duration,
) -> (
    BrokerSession<L>,
    SessionDriver<E, L>,
    mpsc::UnboundedReceiver<AnnounceReason>,
)
where
    E: EventSource,
    L: MqttLink,
{
    let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
    let (announce_tx, announce_rx) = mpsc::unbounded_channel();
    let health = Arc::new(SessionHealth::default());

    let session = BrokerSession {
        link: link.clone(),
        state: state_rx,
        health: health.clone(),
    };
    let driver = SessionDriver {
        events,
        link,
        state: state_tx,
        health,
        announce: announce_tx,
        topics,
        retry_interval,
        ever_connected: false,
    };

    (session, driver, announce_rx)
}

impl<E: EventSource, L: MqttLink> SessionDriver<E, L> {
    /// Drive the connection until `stop` fires or the broker refuses our credentials
    pub async fn run(mut self, stop: CancellationToken) -> Result<(), SessionError> {
        info!("Connecting to broker...");
        self.state.send_replace(SessionState::Connecting);

        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                event = self.events.poll() => event,
            };

            match event {
                Ok(LinkEvent::Connected) => self.on_connected(),
                Ok(LinkEvent::Message { topic, payload }) => self.on_message(&topic, &payload),
                Ok(LinkEvent::Closed) => {
                    info!("Broker connection closed");
                    self.state.send_replace(SessionState::Disconnected);
                    return Ok(());
                }
                Ok(LinkEvent::Idle) => {}
                Err(LinkError::Unauthorized(reason)) => {
                    error!("Authentication failed: {}", reason);
                    self.state.send_replace(SessionState::Disconnected);
                    return Err(SessionError::Unauthorized(reason));
                }
                Err(e) => {
                    self.on_link_error(&e);
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_interval) => {
                            info!("Reconnecting to broker...");
                            self.state.send_replace(SessionState::Connecting);
                        }
                    }
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    fn on_connected(&mut self) {
        if self.ever_connected {
            self.health.record_reconnect();
            info!("Reconnected to broker (reconnects: {})", self.health.reconnects());
        } else {
            info!("Connected to broker");
        }
        self.ever_connected = true;

        for topic in self.topics.subscriptions() {
            if let Err(e) = self.link.subscribe(topic, QoS::AtLeastOnce) {
                warn!("Failed to subscribe to {}: {}", topic, e);
            }
        }

        self.state.send_replace(SessionState::Connected);
        self.request_announce(AnnounceReason::Connected);
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        match control_signal(&self.topics, topic, text.trim()) {
            Some(reason) => {
                info!("Control message on {}: {}", topic, text.trim());
                self.request_announce(reason);
            }
            None => debug!("Ignoring message on {}: {}", topic, text.trim()),
        }
    }

    fn on_link_error(&self, e: &LinkError) {
        if *self.state.borrow() == SessionState::Connected {
            warn!("Lost broker connection: {}", e);
        } else {
            warn!("Connection failed: {}. Retrying in {}s", e, self.retry_interval.as_secs());
        }
        self.health.record_error(e);
        self.state.send_replace(SessionState::Disconnected);
    }

    fn request_announce(&self, reason: AnnounceReason) {
        if self.announce.send(reason).is_err() {
            debug!("Announcement receiver gone, dropping {:?}", reason);
        }
    }

    /// Keep polling so queued requests (offline, disconnect) reach the broker
    async fn drain(&mut self) {
        if *self.state.borrow() != SessionState::Connected {
            self.state.send_replace(SessionState::Disconnected);
            return;
        }

        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match self.events.poll().await {
                    Ok(LinkEvent::Closed) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("Timed out flushing broker requests on shutdown");
        }
        self.state.send_replace(SessionState::Disconnected);
    }
}

/// Map an inbound message to an announcement request, if it is one
pub fn control_signal(topics: &Topics, topic: &str, payload: &str) -> Option<AnnounceReason> {
    if topic == topics.platform_status && payload == "online" {
        Some(AnnounceReason::PlatformOnline)
    } else if topic == topics.command && matches!(payload, "refresh" | "online") {
        Some(AnnounceReason::RefreshRequested)
    } else {
        None
    }
}
