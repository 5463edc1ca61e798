//! Response time percentiles

use serde::{Deserialize, Serialize};

/// Response time percentiles (all values in milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseTimePercentiles {
    /// Minimum value
    pub min: f64,
    /// 50th percentile (median)
    pub p50: f64,
    /// 66th percentile
    pub p66: f64,
    /// 75th percentile
    pub p75: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
    /// Maximum value
    pub max: f64,
    /// Mean value
    pub mean: f64,
}

impl ResponseTimePercentiles {
    /// Calculate percentiles from unsorted samples
    pub fn from_samples<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a f64>,
    {
        let mut sorted: Vec<f64> = samples.into_iter().copied().collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let len = sorted.len();
        Self {
            min: sorted[0],
            p50: percentile(&sorted, 0.50),
            p66: percentile(&sorted, 0.66),
            p75: percentile(&sorted, 0.75),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            max: sorted[len - 1],
            mean: sorted.iter().sum::<f64>() / len as f64,
        }
    }
}

/// Percentile of sorted values using linear interpolation
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let idx = p.clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = idx.floor() as usize;
            let upper = idx.ceil() as usize;
            let frac = idx - lower as f64;
            sorted[lower] * (1.0 - frac) + sorted[upper.min(len - 1)] * frac
        }
    }
}

/// Cumulative response time histogram
///
/// HdrHistogram keeps memory constant regardless of run length; values are
/// stored in microseconds.
#[derive(Debug, Clone)]
pub struct ResponseTimeHistogram {
    histogram: hdrhistogram::Histogram<u64>,
}

impl ResponseTimeHistogram {
    /// Microsecond precision, max 1 hour
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 3_600_000_000, 3)
            .expect("static histogram bounds are valid");
        Self { histogram }
    }

    /// Record a value in milliseconds; out of range values saturate
    pub fn record_ms(&mut self, ms: f64) {
        let micros = (ms.max(0.0) * 1000.0) as u64;
        self.histogram.saturating_record(micros.max(1));
    }

    /// Number of recorded values
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Percentiles over everything recorded since the last reset
    pub fn percentiles(&self) -> ResponseTimePercentiles {
        if self.histogram.is_empty() {
            return ResponseTimePercentiles::default();
        }

        let at = |q: f64| self.histogram.value_at_quantile(q) as f64 / 1000.0;
        ResponseTimePercentiles {
            min: self.histogram.min() as f64 / 1000.0,
            p50: at(0.50),
            p66: at(0.66),
            p75: at(0.75),
            p90: at(0.90),
            p95: at(0.95),
            p99: at(0.99),
            max: self.histogram.max() as f64 / 1000.0,
            mean: self.histogram.mean() / 1000.0,
        }
    }

    /// Reset the histogram
    pub fn reset(&mut self) {
        self.histogram.reset();
    }
}

impl Default for ResponseTimeHistogram {
    fn default() -> Self {
        Self::new()
    }
}
