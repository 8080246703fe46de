//! Periodic publish cycles
//!
//! [`Scheduler`] is a fixed-period timer; ticks missed while a cycle was
//! running are dropped, never replayed. [`Poller`] runs one publish cycle:
//! sensor reads happen on the blocking pool (they may shell out) and the
//! result is published as a single state message.

use crate::payload;
use crate::sensors::{EnablementMap, PollContext, SensorRegistry};
use crate::session::{BrokerSession, Delivery, MqttLink};
use crate::topics::Topics;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    interval: Interval,
}

impl Scheduler {
    /// First tick fires one full `period` from now
    pub fn new(period: Duration) -> Self {
        Self {
            interval: Self::interval(period),
        }
    }

    fn interval(period: Duration) -> Interval {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Restart the period from now
    pub fn reset(&mut self) {
        self.interval.reset();
    }
}

/// What one publish cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub published: bool,
    pub fields: usize,
    pub failed: usize,
}

/// Runs publish cycles against a fixed registry
pub struct Poller {
    registry: Arc<SensorRegistry>,
    enablement: Arc<EnablementMap>,
    state_topic: String,
    context: Option<PollContext>,
    rebuild: Box<dyn Fn() -> PollContext + Send + Sync>,
}

impl Poller {
    /// `rebuild` recreates the poll context if a cycle loses it
    pub fn new<F>(
        registry: Arc<SensorRegistry>,
        enablement: Arc<EnablementMap>,
        topics: &Topics,
        rebuild: F,
    ) -> Self
    where
        F: Fn() -> PollContext + Send + Sync + 'static,
    {
        Self {
            registry,
            enablement,
            state_topic: topics.state.clone(),
            context: Some(rebuild()),
            rebuild: Box::new(rebuild),
        }
    }

    /// Read every enabled sensor and publish the state payload
    ///
    /// Skipped entirely while the session is not connected.
    pub async fn cycle<L: MqttLink>(&mut self, session: &BrokerSession<L>) -> CycleReport {
        if !session.is_connected() {
            debug!("Not connected, skipping publish cycle");
            return CycleReport::default();
        }

        let registry = self.registry.clone();
        let enablement = self.enablement.clone();
        let mut context = match self.context.take() {
            Some(context) => context,
            None => (self.rebuild)(),
        };

        let joined = tokio::task::spawn_blocking(move || {
            let sensors = registry.resolve(&enablement);
            let (fields, failed) = payload::build(&sensors, &mut context);
            (fields, failed, context)
        })
        .await;

        let (fields, failed) = match joined {
            Ok((fields, failed, context)) => {
                self.context = Some(context);
                (fields, failed)
            }
            Err(e) => {
                error!("Publish cycle aborted: {}", e);
                return CycleReport::default();
            }
        };

        let count = fields.len();
        let body = match serde_json::to_vec(&fields) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode state payload: {}", e);
                return CycleReport {
                    published: false,
                    fields: count,
                    failed,
                };
            }
        };

        let published =
            session.publish(&self.state_topic, body, QoS::AtLeastOnce, false) == Delivery::Sent;
        if failed > 0 {
            warn!("Published {} sensors, {} failed", count, failed);
        } else {
            info!("Published {} sensors", count);
        }

        CycleReport {
            published,
            fields: count,
            failed,
        }
    }
}
