//! Per (request_type, name) statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::percentile::{ResponseTimeHistogram, ResponseTimePercentiles};

/// Sizing shared by every entry of one aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySettings {
    /// Recent response times kept for percentiles
    pub window_size: usize,
    /// Seconds used for current request rates
    pub current_window_secs: i64,
}

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            window_size: 1_000,
            current_window_secs: 10,
        }
    }
}

/// Statistics for one (request_type, name) pair, or for the aggregate
#[derive(Debug, Clone)]
pub struct StatsEntry {
    /// Request type
    pub request_type: String,
    /// Request name
    pub name: String,
    /// Requests recorded, failed ones included
    pub num_requests: u64,
    /// Failed requests
    pub num_failures: u64,
    /// Requests that carried a response time
    pub num_timed: u64,
    /// Sum of response times (ms)
    pub total_response_time: f64,
    /// Smallest response time seen (ms)
    pub min_response_time: Option<f64>,
    /// Largest response time seen (ms)
    pub max_response_time: f64,
    /// Sum of response lengths (bytes)
    pub total_content_length: u64,
    /// First request time
    pub start_time: Option<DateTime<Utc>>,
    /// Last request time
    pub last_request_time: Option<DateTime<Utc>>,

    settings: EntrySettings,
    window: VecDeque<f64>,
    histogram: ResponseTimeHistogram,
    reqs_per_sec: BTreeMap<i64, u64>,
    fails_per_sec: BTreeMap<i64, u64>,
}

impl StatsEntry {
    /// Create an empty entry
    pub fn new(
        request_type: impl Into<String>,
        name: impl Into<String>,
        settings: EntrySettings,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            name: name.into(),
            num_requests: 0,
            num_failures: 0,
            num_timed: 0,
            total_response_time: 0.0,
            min_response_time: None,
            max_response_time: 0.0,
            total_content_length: 0,
            start_time: None,
            last_request_time: None,
            settings,
            window: VecDeque::with_capacity(settings.window_size.min(1_024)),
            histogram: ResponseTimeHistogram::new(),
            reqs_per_sec: BTreeMap::new(),
            fails_per_sec: BTreeMap::new(),
        }
    }

    /// Record one request outcome
    pub fn log(
        &mut self,
        response_time: Option<f64>,
        content_length: Option<u64>,
        failed: bool,
        now: DateTime<Utc>,
    ) {
        self.num_requests += 1;
        let second = now.timestamp();
        *self.reqs_per_sec.entry(second).or_insert(0) += 1;
        if failed {
            self.num_failures += 1;
            *self.fails_per_sec.entry(second).or_insert(0) += 1;
        }
        if let Some(ms) = response_time {
            self.num_timed += 1;
            self.total_response_time += ms;
            self.max_response_time = self.max_response_time.max(ms);
            self.min_response_time = Some(self.min_response_time.map_or(ms, |min| min.min(ms)));
            self.push_sample(ms);
        }
        self.total_content_length += content_length.unwrap_or(0);
        self.start_time.get_or_insert(now);
        self.last_request_time = Some(now);
        self.prune_rates(second);
    }

    fn push_sample(&mut self, ms: f64) {
        if self.window.len() == self.settings.window_size {
            self.window.pop_front();
        }
        self.window.push_back(ms);
        self.histogram.record_ms(ms);
    }

    fn prune_rates(&mut self, now_secs: i64) {
        let horizon = now_secs - 2 * self.settings.current_window_secs;
        self.reqs_per_sec = self.reqs_per_sec.split_off(&horizon);
        self.fails_per_sec = self.fails_per_sec.split_off(&horizon);
    }

    /// Successful requests
    pub fn num_successes(&self) -> u64 {
        self.num_requests - self.num_failures
    }

    /// `failures / (successes + failures)`, 0 when empty
    pub fn fail_ratio(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.num_failures as f64 / self.num_requests as f64
        }
    }

    /// Mean response time (ms)
    pub fn avg_response_time(&self) -> f64 {
        if self.num_timed == 0 {
            0.0
        } else {
            self.total_response_time / self.num_timed as f64
        }
    }

    /// Mean response length (bytes)
    pub fn avg_content_length(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_content_length as f64 / self.num_requests as f64
        }
    }

    /// Number of samples currently in the percentile window
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    fn rate_over_window(&self, counters: &BTreeMap<i64, u64>, now: DateTime<Utc>) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let now_secs = now.timestamp();
        let from = now_secs - self.settings.current_window_secs + 1;
        let count: u64 = counters.range(from..=now_secs).map(|(_, n)| n).sum();
        let elapsed = (now_secs - start.timestamp() + 1).max(1);
        count as f64 / elapsed.min(self.settings.current_window_secs) as f64
    }

    /// Requests per second over the recent window
    pub fn current_rps(&self, now: DateTime<Utc>) -> f64 {
        self.rate_over_window(&self.reqs_per_sec, now)
    }

    /// Failures per second over the recent window
    pub fn current_fail_per_sec(&self, now: DateTime<Utc>) -> f64 {
        self.rate_over_window(&self.fails_per_sec, now)
    }

    /// Requests per second since the first request
    pub fn total_rps(&self) -> f64 {
        match (self.start_time, self.last_request_time) {
            (Some(start), Some(last)) => {
                let secs = ((last - start).num_milliseconds() as f64 / 1000.0).max(1.0);
                self.num_requests as f64 / secs
            }
            _ => 0.0,
        }
    }

    /// Percentiles over the recent window
    pub fn percentiles(&self) -> ResponseTimePercentiles {
        ResponseTimePercentiles::from_samples(&self.window)
    }

    /// Percentiles over every sample since the last reset
    pub fn cumulative_percentiles(&self) -> ResponseTimePercentiles {
        self.histogram.percentiles()
    }

    /// Read-only copy for export
    pub fn snapshot(&self, now: DateTime<Utc>) -> EntrySnapshot {
        EntrySnapshot {
            request_type: self.request_type.clone(),
            name: self.name.clone(),
            num_requests: self.num_requests,
            num_failures: self.num_failures,
            fail_ratio: self.fail_ratio(),
            avg_response_time: self.avg_response_time(),
            min_response_time: self.min_response_time.unwrap_or(0.0),
            max_response_time: self.max_response_time,
            avg_content_length: self.avg_content_length(),
            current_rps: self.current_rps(now),
            current_fail_per_sec: self.current_fail_per_sec(now),
            total_rps: self.total_rps(),
            percentiles: self.percentiles(),
            cumulative_percentiles: self.cumulative_percentiles(),
        }
    }

    /// Serializable copy of the counters and the samples in the window
    pub fn to_delta(&self) -> EntryDelta {
        EntryDelta {
            request_type: self.request_type.clone(),
            name: self.name.clone(),
            num_requests: self.num_requests,
            num_failures: self.num_failures,
            num_timed: self.num_timed,
            total_response_time: self.total_response_time,
            min_response_time: self.min_response_time,
            max_response_time: self.max_response_time,
            total_content_length: self.total_content_length,
            response_times: self.window.iter().copied().collect(),
            reqs_per_sec: self.reqs_per_sec.clone(),
            fails_per_sec: self.fails_per_sec.clone(),
            start_time: self.start_time,
            last_request_time: self.last_request_time,
        }
    }

    /// Fold a delta produced elsewhere into this entry
    pub fn merge_delta(&mut self, delta: &EntryDelta) {
        self.num_requests += delta.num_requests;
        self.num_failures += delta.num_failures;
        self.num_timed += delta.num_timed;
        self.total_response_time += delta.total_response_time;
        self.max_response_time = self.max_response_time.max(delta.max_response_time);
        self.min_response_time = match (self.min_response_time, delta.min_response_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.total_content_length += delta.total_content_length;

        for &ms in &delta.response_times {
            self.push_sample(ms);
        }
        for (second, count) in &delta.reqs_per_sec {
            *self.reqs_per_sec.entry(*second).or_insert(0) += count;
        }
        for (second, count) in &delta.fails_per_sec {
            *self.fails_per_sec.entry(*second).or_insert(0) += count;
        }

        self.start_time = match (self.start_time, delta.start_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_request_time = match (self.last_request_time, delta.last_request_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(last) = self.last_request_time {
            self.prune_rates(last.timestamp());
        }
    }

    /// Clear all counters
    pub fn reset(&mut self) {
        *self = Self::new(
            std::mem::take(&mut self.request_type),
            std::mem::take(&mut self.name),
            self.settings,
        );
    }
}

/// Entry counters shipped from a worker to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDelta {
    /// Request type
    pub request_type: String,
    /// Request name
    pub name: String,
    /// Requests recorded
    pub num_requests: u64,
    /// Failed requests
    pub num_failures: u64,
    /// Requests with a response time
    pub num_timed: u64,
    /// Sum of response times (ms)
    pub total_response_time: f64,
    /// Smallest response time (ms)
    pub min_response_time: Option<f64>,
    /// Largest response time (ms)
    pub max_response_time: f64,
    /// Sum of response lengths
    pub total_content_length: u64,
    /// Recent response time samples
    pub response_times: Vec<f64>,
    /// Requests per unix second
    #[serde(with = "per_second")]
    pub reqs_per_sec: BTreeMap<i64, u64>,
    /// Failures per unix second
    #[serde(with = "per_second")]
    pub fails_per_sec: BTreeMap<i64, u64>,
    /// First request time
    pub start_time: Option<DateTime<Utc>>,
    /// Last request time
    pub last_request_time: Option<DateTime<Utc>>,
}

/// Per-second counters as `[second, count]` pairs
///
/// JSON object keys are strings, and the buffered decoding of tagged
/// protocol messages cannot turn them back into integers.
mod per_second {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &BTreeMap<i64, u64>, s: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(i64, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        pairs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<i64, u64>, D::Error> {
        let pairs = Vec::<(i64, u64)>::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}

/// Exported view of one entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// Request type
    pub request_type: String,
    /// Request name
    pub name: String,
    /// Requests recorded
    pub num_requests: u64,
    /// Failed requests
    pub num_failures: u64,
    /// Failure ratio (0.0 - 1.0)
    pub fail_ratio: f64,
    /// Mean response time (ms)
    pub avg_response_time: f64,
    /// Smallest response time (ms)
    pub min_response_time: f64,
    /// Largest response time (ms)
    pub max_response_time: f64,
    /// Mean response length (bytes)
    pub avg_content_length: f64,
    /// Recent requests per second
    pub current_rps: f64,
    /// Recent failures per second
    pub current_fail_per_sec: f64,
    /// Requests per second since the first request
    pub total_rps: f64,
    /// Percentiles over the recent window
    pub percentiles: ResponseTimePercentiles,
    /// Percentiles over the whole run
    pub cumulative_percentiles: ResponseTimePercentiles,
}

/// Occurrences of one distinct error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsError {
    /// Request type
    pub request_type: String,
    /// Request name
    pub name: String,
    /// Error description
    pub error: String,
    /// Times seen
    pub occurrences: u64,
}

impl StatsError {
    /// Key identifying this error in the errors table
    pub fn key(request_type: &str, name: &str, error: &str) -> String {
        format!("{request_type}.{name}.{error}")
    }
}
