//! Latency histogram using HdrHistogram
//!
//! Records the latency of every object operation charged to a volume while
//! its measurement window is open. Percentiles are computed on demand when a
//! run is summarized.
//!
//! # Example
//!
//! ```
//! use iodriver::stats::histogram::LatencyHistogram;
//! use std::time::Duration;
//!
//! let mut hist = LatencyHistogram::new();
//! hist.record(Duration::from_micros(100));
//! hist.record(Duration::from_micros(150));
//! hist.record(Duration::from_micros(200));
//!
//! let summary = hist.summary();
//! println!("p50: {}us, p99: {}us", summary.p50_us, summary.p99_us);
//! ```

use crate::Result;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

/// Largest trackable latency: one hour in nanoseconds
const MAX_TRACKABLE_NANOS: u64 = 3_600_000_000_000;

/// Latency histogram wrapper
///
/// Tracks latencies from 1 nanosecond to 1 hour with 3 significant digits
/// (values accurate to within 0.1%). Recording and querying are O(1).
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

/// Percentile snapshot of a histogram, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: f64,
    pub mean_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // Bounds are constant and valid, so construction cannot fail
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKABLE_NANOS, 3)
            .expect("Failed to create histogram with valid bounds");

        Self { histogram }
    }

    /// Record a latency sample, clamped to the trackable range
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        let value = nanos.clamp(1, MAX_TRACKABLE_NANOS);
        let _ = self.histogram.record(value);
    }

    /// Latency at `percentile` (0.0 - 100.0), or None if empty
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.value_at_percentile(percentile)))
    }

    pub fn min(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.min()))
    }

    pub fn max(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.max()))
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_nanos(self.histogram.mean() as u64))
    }

    /// Number of samples recorded
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.len() == 0
    }

    /// Merge another histogram into this one
    ///
    /// Used to combine the per-volume histograms into a run-wide view.
    pub fn merge(&mut self, other: &LatencyHistogram) -> Result<()> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| anyhow::anyhow!("Failed to merge histograms: {}", e))?;
        Ok(())
    }

    /// Snapshot count, min, mean, p50, p99 and max
    pub fn summary(&self) -> LatencySummary {
        if self.is_empty() {
            return LatencySummary::default();
        }
        let micros = |nanos: f64| nanos / 1_000.0;
        LatencySummary {
            count: self.len(),
            min_us: micros(self.histogram.min() as f64),
            mean_us: micros(self.histogram.mean()),
            p50_us: micros(self.histogram.value_at_percentile(50.0) as f64),
            p99_us: micros(self.histogram.value_at_percentile(99.0) as f64),
            max_us: micros(self.histogram.max() as f64),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}
