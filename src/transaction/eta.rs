//! Rate and ETA estimation.
//!
//! A low-pass filtered rate estimator after legraphista's `simple-eta`
//! (MIT). Timestamps are caller supplied so paused time can be cut out.

use std::time::Duration;

/// Low-pass filtered progress rate estimator.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    max: f64,
    time_constant: f64,
    rate: Option<f64>,
    last_progress: Option<f64>,
    last_timestamp: Option<f64>,
}

impl ProgressTracker {
    /// Start tracking from `min` at `start`, towards `max`.
    ///
    /// `time_constant` is the filter's RC in seconds; larger values smooth more.
    pub fn new(min: f64, max: f64, time_constant: f64, start: Duration) -> Self {
        let mut tracker = Self {
            max,
            time_constant,
            rate: None,
            last_progress: None,
            last_timestamp: None,
        };
        tracker.report(min, start);
        tracker
    }

    /// Feed a progress sample
    pub fn report(&mut self, progress: f64, at: Duration) {
        let timestamp = at.as_secs_f64();
        if self.last_timestamp == Some(timestamp) {
            return;
        }

        let (Some(last_progress), Some(last_timestamp)) = (self.last_progress, self.last_timestamp)
        else {
            self.last_progress = Some(progress);
            self.last_timestamp = Some(timestamp);
            return;
        };

        let dt = timestamp - last_timestamp;
        let current = (progress - last_progress) / dt;
        self.rate = Some(match self.rate {
            None => current,
            Some(previous) => {
                let alpha = dt / (dt + self.time_constant);
                previous + alpha * (current - previous)
            },
        });
        self.last_progress = Some(progress);
        self.last_timestamp = Some(timestamp);
    }

    /// Seconds remaining as of `at`; infinite until a rate is known
    pub fn estimate(&self, at: Duration) -> f64 {
        let Some(last_progress) = self.last_progress else {
            return f64::INFINITY;
        };
        if last_progress >= self.max {
            return 0.0;
        }
        let Some(rate) = self.rate else {
            return f64::INFINITY;
        };

        let mut remaining = (self.max - last_progress) / rate;
        if let Some(last_timestamp) = self.last_timestamp {
            remaining -= at.as_secs_f64() - last_timestamp;
        }
        remaining.max(0.0)
    }

    /// Filtered rate in units per second
    pub fn rate(&self) -> f64 {
        self.rate.unwrap_or(0.0)
    }
}

/// Human readable byte count
pub fn format_bytes(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if !bytes.is_finite() || bytes < KB {
        format!("{} B", bytes.max(0.0).round())
    } else if bytes < MB {
        format!("{:.1} KB", bytes / KB)
    } else if bytes < GB {
        format!("{:.1} MB", bytes / MB)
    } else {
        format!("{:.1} GB", bytes / GB)
    }
}
