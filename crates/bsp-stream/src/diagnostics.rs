//! Device counter continuity checks

use std::time::{Duration, Instant};
use tracing::warn;

/// Samples missing between two consecutive 8-bit counters
#[inline]
pub fn counter_gap(previous: u8, current: u8) -> u8 {
    current.wrapping_sub(previous).wrapping_sub(1)
}

/// Tracks counter gaps across batches and rate-limits their reporting.
///
/// Missing counts accumulate between reports; at most one report is
/// produced per `report_interval`.
#[derive(Debug)]
pub struct CounterTracker {
    last_counter: Option<u8>,
    unreported: u64,
    total_missing: u64,
    report_interval: Duration,
    last_report: Option<Instant>,
}

impl CounterTracker {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            last_counter: None,
            unreported: 0,
            total_missing: 0,
            report_interval,
            last_report: None,
        }
    }

    pub fn total_missing(&self) -> u64 {
        self.total_missing
    }

    pub fn unreported(&self) -> u64 {
        self.unreported
    }

    /// Feed counters in arrival order; returns the missing samples found
    pub fn observe<I: IntoIterator<Item = u8>>(&mut self, counters: I) -> u64 {
        let mut missing = 0u64;
        for counter in counters {
            if let Some(previous) = self.last_counter {
                missing += counter_gap(previous, counter) as u64;
            }
            self.last_counter = Some(counter);
        }
        self.unreported += missing;
        self.total_missing += missing;
        missing
    }

    /// Take the accumulated count if a report is due at `now`
    pub fn take_report(&mut self, now: Instant) -> Option<u64> {
        if self.unreported == 0 {
            return None;
        }
        let due = self
            .last_report
            .map_or(true, |last| now.saturating_duration_since(last) >= self.report_interval);
        if !due {
            return None;
        }

        let count = std::mem::take(&mut self.unreported);
        self.last_report = Some(now);
        warn!(missing = count, total = self.total_missing, "device counter gap; samples missing");
        Some(count)
    }

    /// Forget the last counter, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.last_counter = None;
        self.unreported = 0;
    }
}
