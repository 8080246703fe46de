//! Agent controller
//!
//! Startup order:
//! 1. Build the sensor registry (built-in sensors plus probed drives)
//! 2. Resolve enablement from settings and host capabilities
//! 3. Start the session driver and wait for the first connection
//! 4. On every (re)connect: discovery, `online`, one immediate state cycle
//! 5. Publish cycles on the configured interval until shutdown
//!
//! On shutdown `offline` is published (best effort) before the session is
//! closed and the driver is stopped.

use crate::capabilities::CapabilityDetector;
use crate::config::Settings;
use crate::discovery::{DeviceIdentity, DiscoveryPublisher};
use crate::facts::{self, HostFacts};
use crate::scheduler::{Poller, Scheduler};
use crate::sensors::drives::{self, probe_mount};
use crate::sensors::{DuplicateSensorError, EnablementMap, PollContext, SensorRegistry};
use crate::session::link::{self, TlsFileError};
use crate::session::{self, AnnounceReason, EventSource, MqttLink, SessionError, RETRY_INTERVAL};
use crate::topics::Topics;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Registry(#[from] DuplicateSensorError),

    #[error(transparent)]
    Tls(#[from] TlsFileError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("session driver panicked: {0}")]
    DriverPanicked(String),
}

/// Registry and enablement for this host
pub fn build_sensors(
    settings: &Settings,
) -> Result<(SensorRegistry, EnablementMap), DuplicateSensorError> {
    let mut registry = SensorRegistry::with_builtin()?;
    drives::register_drives(&mut registry, settings.sensors.external_drives(), probe_mount);

    let capabilities = CapabilityDetector::detect_all();
    for capability in capabilities.iter().filter(|c| !c.available) {
        debug!("{:?} unavailable: {:?}", capability.capability_type, capability.reason);
    }

    let enablement = EnablementMap::build(&registry, &settings.sensors, &capabilities);
    Ok((registry, enablement))
}

pub struct Agent<L, E> {
    settings: Settings,
    link: L,
    events: E,
    retry_interval: Duration,
    sensors: Option<(SensorRegistry, EnablementMap)>,
}

impl Agent<AsyncClient, EventLoop> {
    /// Agent talking to the broker named in `settings`
    pub fn connect(settings: Settings) -> Result<Self, AgentError> {
        let topics = Topics::from_settings(&settings);
        let (client, eventloop) = link::connect(&settings.client_id, &settings.mqtt, &topics)?;
        Ok(Self::new(settings, client, eventloop))
    }
}

impl<L: MqttLink, E: EventSource> Agent<L, E> {
    pub fn new(settings: Settings, link: L, events: E) -> Self {
        Self {
            settings,
            link,
            events,
            retry_interval: RETRY_INTERVAL,
            sensors: None,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Use a prepared registry instead of probing the host
    pub fn with_sensors(mut self, registry: SensorRegistry, enablement: EnablementMap) -> Self {
        self.sensors = Some((registry, enablement));
        self
    }

    /// Run until `shutdown` fires or the broker rejects our credentials
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let (registry, enablement) = match self.sensors.take() {
            Some(sensors) => sensors,
            None => build_sensors(&self.settings)?,
        };
        info!(
            "{} of {} sensors enabled",
            registry.resolve(&enablement).len(),
            registry.len()
        );

        let registry = Arc::new(registry);
        let enablement = Arc::new(enablement);
        let topics = Topics::from_settings(&self.settings);

        let publisher = DiscoveryPublisher::new(
            DeviceIdentity::new(
                self.settings.device_slug(),
                self.settings.device_name.clone(),
                facts::host_os_name(),
            ),
            topics.clone(),
        );

        let timezone = self.settings.timezone;
        let mut poller = Poller::new(registry.clone(), enablement.clone(), &topics, move || {
            PollContext::new(HostFacts::new(timezone))
        });
        let mut scheduler = Scheduler::new(self.settings.update_interval);

        let (session, driver, mut announces) =
            session::open(self.link, self.events, topics.clone(), self.retry_interval);
        let driver_stop = CancellationToken::new();
        let mut driver_task = tokio::spawn(driver.run(driver_stop.clone()));

        if let Err(e) = session.wait_connected(&shutdown).await {
            driver_stop.cancel();
            let outcome = finish_driver(driver_task).await;
            return match e {
                SessionError::Cancelled => {
                    info!("Shutdown requested before connecting");
                    outcome
                }
                other => outcome.and(Err(other.into())),
            };
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                outcome = &mut driver_task => {
                    return match outcome {
                        Ok(Ok(())) => Err(SessionError::DriverStopped.into()),
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => Err(AgentError::DriverPanicked(e.to_string())),
                    };
                }

                Some(reason) = announces.recv() => {
                    debug!("Announcing sensors ({:?})", reason);
                    let sensors = registry.resolve(&enablement);
                    publisher.announce(&session, &sensors);

                    if reason == AnnounceReason::Connected {
                        poller.cycle(&session).await;
                        scheduler.reset();
                    }
                }

                _ = scheduler.tick() => {
                    poller.cycle(&session).await;
                }
            }
        }

        session.publish(&topics.availability, "offline", QoS::AtLeastOnce, true);
        session.close();
        driver_stop.cancel();

        let outcome = finish_driver(driver_task).await;
        if let Some(error) = session.health().last_error() {
            debug!(
                "Session ended after {} reconnects, last error: {}",
                session.health().reconnects(),
                error
            );
        }
        info!("Agent stopped");
        outcome
    }
}

async fn finish_driver(handle: JoinHandle<Result<(), SessionError>>) -> Result<(), AgentError> {
    match handle.await {
        Ok(result) => result.map_err(AgentError::from),
        Err(e) => {
            warn!("Session driver did not finish cleanly: {}", e);
            Err(AgentError::DriverPanicked(e.to_string()))
        }
    }
}
