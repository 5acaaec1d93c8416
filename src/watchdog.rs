//! Self-usage watchdog.
//!
//! The probe watches its own CPU fraction. For the first twenty minutes it
//! only averages what it sees; after that the average is frozen and any
//! sample above three times the calibrated baseline puts the probe into
//! lockdown: the loop pauses and the capture workers drop packets until a
//! normal sample arrives.

use std::time::{Duration, Instant};

use tracing::info;

/// How long the watchdog averages before it starts enforcing.
const CALIBRATION_WINDOW: Duration = Duration::from_secs(1_200);
/// A sample above `factor × average` triggers lockdown.
const LOCKDOWN_FACTOR: f64 = 3.0;

/// Calibrating anomaly detector over the probe's own CPU fraction.
#[derive(Debug)]
pub struct UsageWatchdog {
    enabled: bool,
    started: Instant,
    window: Duration,
    calibrated: bool,
    sum: f64,
    count: u32,
    average: f64,
    last: f64,
}

impl UsageWatchdog {
    pub fn new(enabled: bool) -> Self {
        Self::with_window(enabled, CALIBRATION_WINDOW)
    }

    /// Watchdog with a custom calibration window. Tests use a zero window
    /// so the first sample calibrates.
    pub fn with_window(enabled: bool, window: Duration) -> Self {
        Self {
            enabled,
            started: Instant::now(),
            window,
            calibrated: false,
            sum: 0.0,
            count: 0,
            average: 0.0,
            last: 0.0,
        }
    }

    /// Feeds one CPU fraction sample. During calibration the sample extends
    /// the running average; afterwards only the last sample is tracked and
    /// the average never re-adapts.
    pub fn push_sample(&mut self, cpu_fraction: f64) {
        if !self.enabled {
            return;
        }
        self.last = cpu_fraction;
        if self.calibrated {
            return;
        }

        self.sum += cpu_fraction;
        self.count += 1;

        if self.started.elapsed() >= self.window {
            self.average = self.sum / f64::from(self.count);
            self.calibrated = true;
            info!(
                "watchdog calibrated: baseline cpu fraction {:.6}",
                self.average
            );
        }
    }

    /// Whether the most recent sample crossed the lockdown threshold.
    pub fn is_lockdown(&self) -> bool {
        self.enabled && self.calibrated && self.last > LOCKDOWN_FACTOR * self.average
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
