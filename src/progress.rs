//! Progress sampling: wall-clock speed, ETA, and report-rate throttling
//!
//! Transfers report progress at a bounded rate so a slow consumer (log file,
//! terminal redraw) never becomes the bottleneck of an 8 MiB/frame hot loop.

use std::time::{Duration, Instant};

use crate::protocol::timeouts::PROGRESS_TICK_MS;

/// One progress observation of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    /// Speed since the previous report.
    pub speed_bps: f64,
    /// Speed since the transfer started.
    pub avg_speed_bps: f64,
    pub elapsed: Duration,
    pub eta: Duration,
}

impl ProgressSample {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            self.bytes_sent as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

/// Computes throttled [`ProgressSample`]s from a monotonically growing
/// bytes-sent counter.
pub struct ProgressMeter {
    total_bytes: u64,
    started: Instant,
    min_interval: Duration,
    last_report: Option<(Instant, u64)>,
}

impl ProgressMeter {
    pub fn new(total_bytes: u64) -> Self {
        Self::with_interval(total_bytes, Duration::from_millis(PROGRESS_TICK_MS))
    }

    pub fn with_interval(total_bytes: u64, min_interval: Duration) -> Self {
        ProgressMeter {
            total_bytes,
            started: Instant::now(),
            min_interval,
            last_report: None,
        }
    }

    /// Returns a sample if enough time has passed since the last report, or
    /// if the transfer just completed. Completion always reports, so the
    /// final 100% observation is never throttled away.
    pub fn sample(&mut self, bytes_sent: u64) -> Option<ProgressSample> {
        let now = Instant::now();
        let complete = bytes_sent >= self.total_bytes;
        if let Some((last, _)) = self.last_report {
            if !complete && now.duration_since(last) < self.min_interval {
                return None;
            }
        }
        Some(self.take_sample(now, bytes_sent))
    }

    /// Unthrottled sample, for terminal events.
    pub fn force(&mut self, bytes_sent: u64) -> ProgressSample {
        self.take_sample(Instant::now(), bytes_sent)
    }

    fn take_sample(&mut self, now: Instant, bytes_sent: u64) -> ProgressSample {
        let elapsed = now.duration_since(self.started);
        let avg_speed_bps = if elapsed.as_secs_f64() > 0.0 {
            bytes_sent as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let speed_bps = match self.last_report {
            Some((last, last_bytes)) => {
                let dt = now.duration_since(last).as_secs_f64();
                if dt > 0.0 {
                    (bytes_sent.saturating_sub(last_bytes)) as f64 / dt
                } else {
                    avg_speed_bps
                }
            }
            None => avg_speed_bps,
        };
        let remaining = self.total_bytes.saturating_sub(bytes_sent);
        let eta = if avg_speed_bps > 0.0 {
            Duration::from_secs_f64(remaining as f64 / avg_speed_bps)
        } else {
            Duration::ZERO
        };
        self.last_report = Some((now, bytes_sent));
        ProgressSample {
            bytes_sent,
            total_bytes: self.total_bytes,
            speed_bps,
            avg_speed_bps,
            elapsed,
            eta,
        }
    }
}
