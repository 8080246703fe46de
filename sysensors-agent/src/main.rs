//! System Sensors agent binary
//!
//! Loads settings, connects to the broker and publishes until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use sysensors_agent::{Agent, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sysensors-agent")]
#[command(about = "Publishes host sensors to an MQTT broker using discovery", version)]
struct Cli {
    /// Path to the settings file (defaults to settings.yaml next to the binary)
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sysensors_agent=info")),
        )
        .init();

    let cli = Cli::parse();
    let path = cli.settings.unwrap_or_else(Settings::default_path);

    let settings = Settings::load(&path)
        .await
        .with_context(|| format!("Invalid settings in {}", path.display()))?;

    info!(
        "System Sensors agent v{} starting for {} ({}:{})",
        env!("CARGO_PKG_VERSION"),
        settings.device_name,
        settings.mqtt.hostname,
        settings.mqtt.port
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    Agent::connect(settings)
        .context("Failed to create MQTT client")?
        .run(shutdown)
        .await
        .context("Agent execution failed")?;

    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }

    shutdown.cancel();
}
