//! Counter-to-rate conversion for network throughput sensors

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Interval substituted when two samples share a timestamp
const MIN_ELAPSED: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct RateState {
    previous_value: u64,
    previous_timestamp: Instant,
}

/// Previous sample per named counter
///
/// Owned by the polling side; nothing else reads or writes it.
#[derive(Debug, Default)]
pub struct RateTracker {
    counters: HashMap<String, RateState>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate in kilobits per second since the previous sample of `counter_name`
    ///
    /// The first sample of a counter returns 0. A counter that went backwards
    /// (interface reset) yields 0 instead of a negative rate.
    pub fn sample(&mut self, counter_name: &str, raw_value: u64, now: Instant) -> f64 {
        let Some(previous) = self.counters.get_mut(counter_name) else {
            self.counters.insert(
                counter_name.to_string(),
                RateState {
                    previous_value: raw_value,
                    previous_timestamp: now,
                },
            );
            return 0.0;
        };

        let mut elapsed = now.saturating_duration_since(previous.previous_timestamp);
        if elapsed.is_zero() {
            elapsed = MIN_ELAPSED;
        }

        let delta = raw_value.saturating_sub(previous.previous_value);
        let rate = delta as f64 * 8.0 / elapsed.as_secs_f64() / 1024.0;

        previous.previous_value = raw_value;
        previous.previous_timestamp = previous.previous_timestamp.max(now);

        rate
    }
}
