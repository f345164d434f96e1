use std::time::Duration;

use tracing::{info, warn};

use crate::config::CongestionConfig;

/// Binary classifier of "network currently unhealthy", driven purely by RTT
///  threshold crossing with hysteresis - this is *not* a bandwidth estimator.
///
/// The monitor flips to congested the instant the average RTT exceeds the
///  configured threshold. It flips back only after the configured reset time
///  of *continuously* below-threshold RTT; any above-threshold sample zeroes
///  the accumulated quiet time. While congested, callers are expected to
///  throttle non-essential traffic (keep-alives drop to roughly one in three
///  ticks).
pub struct CongestionMonitor {
    congested_rtt_threshold: Duration,
    reset_congested_time: Duration,
    is_congested: bool,
    time_not_congested: Duration,
}

impl CongestionMonitor {
    pub fn new(config: &CongestionConfig) -> CongestionMonitor {
        CongestionMonitor {
            congested_rtt_threshold: config.congested_rtt_threshold,
            reset_congested_time: config.effective_reset_congested_time(),
            is_congested: false,
            time_not_congested: Duration::ZERO,
        }
    }

    pub fn is_congested(&self) -> bool {
        self.is_congested
    }

    /// Called once per tick with the elapsed time and the current RTT average:
    ///  accumulates quiet time and leaves the congested state once enough of
    ///  it has passed.
    pub fn on_update(&mut self, delta_time: Duration, average_round_trip: Duration) {
        if average_round_trip < self.congested_rtt_threshold {
            self.time_not_congested += delta_time;
        }

        if self.is_congested && self.time_not_congested > self.reset_congested_time {
            info!("connection is no longer congested");
            self.is_congested = false;
        }
    }

    /// Called whenever a new RTT sample moved the average: enters the
    ///  congested state on threshold crossing.
    pub fn on_round_trip_change(&mut self, average_round_trip: Duration) {
        if average_round_trip > self.congested_rtt_threshold {
            self.time_not_congested = Duration::ZERO;

            if !self.is_congested {
                warn!("connection is now congested (avg rtt {:?})", average_round_trip);
                self.is_congested = true;
            }
        }
    }
}
