//! System Sensors agent
//!
//! Periodically samples host metrics (CPU, memory, disk, network, temperature,
//! power, connectivity) and publishes them over MQTT:
//! - Discovery config per sensor so the automation platform registers them
//! - One JSON state message per cycle
//! - Availability (`online`/`offline`) with a last will for crash detection

pub mod agent;
pub mod capabilities;
pub mod config;
pub mod discovery;
pub mod execution;
pub mod facts;
pub mod payload;
pub mod rate;
pub mod scheduler;
pub mod sensors;
pub mod session;
pub mod topics;

pub use agent::{Agent, AgentError};
pub use config::{ConfigError, Settings};
