//! Advisory progress reporting for long scans.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait ProgressReporter: Send {
    fn progress(&mut self, fraction: f64, eta_seconds: u64);
}

/// Reporter that drops everything on the floor.
#[derive(Default)]
pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn progress(&mut self, _fraction: f64, _eta_seconds: u64) {}
}

const SMOOTHING_FACTOR: f64 = 0.75;
const MIN_SAMPLE_SECS: u64 = 10;

/// Units-per-second measurement smoothed with a 0.75 moving average,
/// sampled at most once every ten seconds.
pub struct ProgressMeasurer {
    total: u64,
    then: u64,
    last_sample: u64,
    avg_speed: f64,
}

impl ProgressMeasurer {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            then: unix_now(),
            last_sample: 0,
            avg_speed: 0.0,
        }
    }

    pub fn advance(&mut self, to: u64) {
        if to == self.last_sample {
            return;
        }
        let now = unix_now();
        if now < self.then + MIN_SAMPLE_SECS {
            return;
        }

        let speed = (to.saturating_sub(self.last_sample)) as f64 / (now - self.then) as f64;
        if self.last_sample == 0 {
            self.avg_speed = speed;
        }
        self.last_sample = to;
        self.avg_speed = SMOOTHING_FACTOR * speed + (1.0 - SMOOTHING_FACTOR) * self.avg_speed;
        self.then = now;
    }

    pub fn fraction_completed(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.last_sample as f64 / self.total as f64
    }

    pub fn units_per_second(&self) -> f64 {
        self.avg_speed
    }

    pub fn remaining_seconds(&self) -> u64 {
        if self.avg_speed <= 0.0 {
            return 0;
        }
        ((self.total.saturating_sub(self.last_sample)) as f64 / self.avg_speed) as u64
    }

    pub fn report(&self, reporter: &mut dyn ProgressReporter) {
        reporter.progress(self.fraction_completed(), self.remaining_seconds());
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
