//! Bounded execution of external commands
//!
//! Some sensors can only be read by shelling out (`iwgetid`, `apt-get`).
//! Every such call goes through [`run_bounded`], which:
//! - Captures stdout/stderr
//! - Terminates the child when the time limit elapses
//! - Reports non-zero exit codes as errors

use process_control::{ChildExt, Control};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Time limit applied to every external command run by an accessor
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` did not finish within {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Run `program args...` and return its trimmed stdout, killing it after `timeout`
pub fn run_bounded(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CommandError> {
    let start_time = Instant::now();
    debug!("Executing {} {:?} (timeout: {}s)", program, args, timeout.as_secs());

    let spawn_error = |source: std::io::Error| CommandError::Spawn {
        program: program.to_string(),
        source,
    };

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;

    let output = child
        .controlled_with_output()
        .time_limit(timeout)
        .terminate_for_timeout()
        .wait()
        .map_err(spawn_error)?
        .ok_or_else(|| CommandError::TimedOut {
            program: program.to_string(),
            timeout,
        })?;

    debug!("{} finished in {}ms", program, start_time.elapsed().as_millis());

    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
