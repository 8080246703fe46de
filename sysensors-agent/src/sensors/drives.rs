//! External drive sensors declared in settings
//!
//! Each `sensors.external_drives.<label>: <path>` entry becomes a
//! `disk_use_<label>` sensor, but only if its path is an actual mount point.
//! Entries that fail the probe are left out of the registry entirely.

use super::{SensorDefinition, SensorRegistry, SensorValue};
use crate::facts;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{} cannot be resolved: {source}", .path.display())]
    Unresolvable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a mounted filesystem", .0.display())]
    NotMounted(PathBuf),
}

pub fn drive_sensor_id(label: &str) -> String {
    format!("disk_use_{}", label.to_lowercase().replace(' ', "_"))
}

pub fn drive_sensor(label: &str, path: PathBuf) -> SensorDefinition {
    let display_name = format!("Disk Use {}", label);
    SensorDefinition::measurement(drive_sensor_id(label), display_name, move |ctx| {
        Ok(SensorValue::fixed(ctx.facts.disk_usage_percent(&path)?, 1))
    })
    .unit("%")
    .icon("harddisk")
}

/// Check that `path` is the mount point of a filesystem the OS knows about
pub fn probe_mount(path: &Path) -> Result<(), ProbeError> {
    let resolved = path
        .canonicalize()
        .map_err(|source| ProbeError::Unresolvable {
            path: path.to_path_buf(),
            source,
        })?;

    if facts::mount_points().iter().any(|mount| *mount == resolved) {
        Ok(())
    } else {
        Err(ProbeError::NotMounted(resolved))
    }
}

/// Register one sensor per drive that passes `probe`; returns how many were added
pub fn register_drives<'a, I, P>(registry: &mut SensorRegistry, drives: I, probe: P) -> usize
where
    I: IntoIterator<Item = (&'a str, &'a Path)>,
    P: Fn(&Path) -> Result<(), ProbeError>,
{
    let mut added = 0;

    for (label, path) in drives {
        if let Err(e) = probe(path) {
            warn!("Drive `{}` skipped: {}", label, e);
            continue;
        }

        match registry.register(drive_sensor(label, path.to_path_buf())) {
            Ok(()) => {
                info!("Drive `{}` registered at {}", label, path.display());
                added += 1;
            }
            Err(e) => warn!("Drive `{}` skipped: {}", label, e),
        }
    }

    added
}
