//! Request statistics aggregation

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ListenerError;
use crate::events::{Listener, RequestEvent};

use super::entry::{EntryDelta, EntrySettings, EntrySnapshot, StatsEntry, StatsError};

/// Name of the aggregate entry
pub const TOTAL_NAME: &str = "Aggregated";

/// Point-in-time copy of all statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Per (request_type, name) entries, sorted by name then type
    pub entries: Vec<EntrySnapshot>,
    /// The aggregate entry
    pub total: EntrySnapshot,
    /// Distinct errors, most frequent first
    pub errors: Vec<StatsError>,
}

impl StatsSnapshot {
    /// Look up one entry
    pub fn entry(&self, request_type: &str, name: &str) -> Option<&EntrySnapshot> {
        self.entries
            .iter()
            .find(|e| e.request_type == request_type && e.name == name)
    }
}

/// Statistics accumulated since the previous delta, as shipped by workers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    /// Entry counters
    pub entries: Vec<EntryDelta>,
    /// Error counters
    pub errors: Vec<StatsError>,
}

impl StatsDelta {
    /// Whether the delta carries nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.errors.is_empty()
    }
}

type EntryKey = (String, String);

struct StatsInner {
    entries: HashMap<EntryKey, StatsEntry>,
    total: StatsEntry,
    errors: HashMap<String, StatsError>,
}

impl StatsInner {
    fn new(settings: EntrySettings) -> Self {
        Self {
            entries: HashMap::new(),
            total: StatsEntry::new("", TOTAL_NAME, settings),
            errors: HashMap::new(),
        }
    }

    fn entry_mut(
        &mut self,
        request_type: &str,
        name: &str,
        settings: EntrySettings,
    ) -> &mut StatsEntry {
        self.entries
            .entry((request_type.to_string(), name.to_string()))
            .or_insert_with(|| StatsEntry::new(request_type, name, settings))
    }

    fn add_error(&mut self, error: &StatsError) {
        let key = StatsError::key(&error.request_type, &error.name, &error.error);
        self.errors
            .entry(key)
            .and_modify(|existing| existing.occurrences += error.occurrences)
            .or_insert_with(|| error.clone());
    }
}

/// Aggregates request events into per-name and total statistics
///
/// All mutation goes through one mutex, so concurrent `record` calls never
/// interleave and readers always see a consistent view.
pub struct RequestStats {
    settings: EntrySettings,
    inner: Mutex<StatsInner>,
}

impl RequestStats {
    /// Create an empty aggregator
    pub fn new(settings: EntrySettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(StatsInner::new(settings)),
        }
    }

    /// Record one request event
    pub fn record(&self, event: &RequestEvent) {
        let now = Utc::now();
        let failed = event.is_failure();
        let mut inner = self.inner.lock();

        inner
            .entry_mut(&event.request_type, &event.name, self.settings)
            .log(event.response_time, event.response_length, failed, now);
        inner
            .total
            .log(event.response_time, event.response_length, failed, now);

        if let Some(exception) = &event.exception {
            inner.add_error(&StatsError {
                request_type: event.request_type.clone(),
                name: event.name.clone(),
                error: exception.clone(),
                occurrences: 1,
            });
        }
    }

    /// Fail ratio over every request since the last reset
    pub fn fail_ratio(&self) -> f64 {
        self.inner.lock().total.fail_ratio()
    }

    /// Requests recorded since the last reset
    pub fn total_requests(&self) -> u64 {
        self.inner.lock().total.num_requests
    }

    /// Failures recorded since the last reset
    pub fn total_failures(&self) -> u64 {
        self.inner.lock().total.num_failures
    }

    /// Copy everything out for export
    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        let inner = self.inner.lock();

        let mut entries: Vec<EntrySnapshot> =
            inner.entries.values().map(|e| e.snapshot(now)).collect();
        entries.sort_by(|a, b| (&a.name, &a.request_type).cmp(&(&b.name, &b.request_type)));

        let mut errors: Vec<StatsError> = inner.errors.values().cloned().collect();
        errors.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then(a.error.cmp(&b.error)));

        StatsSnapshot {
            timestamp: now,
            entries,
            total: inner.total.snapshot(now),
            errors,
        }
    }

    /// Clear all counters
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = StatsInner::new(self.settings);
        tracing::debug!("Request stats reset");
    }

    /// Drain everything recorded since the previous call
    pub fn take_delta(&self) -> StatsDelta {
        let mut inner = self.inner.lock();
        let drained = std::mem::replace(&mut *inner, StatsInner::new(self.settings));

        let mut entries: Vec<EntryDelta> =
            drained.entries.values().map(StatsEntry::to_delta).collect();
        entries.sort_by(|a, b| (&a.name, &a.request_type).cmp(&(&b.name, &b.request_type)));

        StatsDelta {
            entries,
            errors: drained.errors.into_values().collect(),
        }
    }

    /// Fold a delta from another process into these statistics
    pub fn merge_delta(&self, delta: &StatsDelta) {
        if delta.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for entry in &delta.entries {
            inner
                .entry_mut(&entry.request_type, &entry.name, self.settings)
                .merge_delta(entry);
            inner.total.merge_delta(entry);
        }
        for error in &delta.errors {
            inner.add_error(error);
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new(EntrySettings::default())
    }
}

impl std::fmt::Debug for RequestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RequestStats")
            .field("entries", &inner.entries.len())
            .field("num_requests", &inner.total.num_requests)
            .field("num_failures", &inner.total.num_failures)
            .finish()
    }
}

/// Feeds request events into a shared [`RequestStats`]
#[derive(Debug, Clone)]
pub struct StatsListener(pub Arc<RequestStats>);

impl Listener<RequestEvent> for StatsListener {
    fn handle(&self, event: &RequestEvent) -> Result<(), ListenerError> {
        self.0.record(event);
        Ok(())
    }

    fn name(&self) -> &str {
        "stats"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Events;

    fn ok(name: &str, ms: f64) -> RequestEvent {
        RequestEvent::new("GET", name).with_response_time(ms)
    }

    fn failed(name: &str, error: &str) -> RequestEvent {
        RequestEvent::new("GET", name)
            .with_response_time(1.0)
            .with_exception(error)
    }

    #[test]
    fn test_fail_ratio_empty_is_zero() {
        let stats = RequestStats::default();
        assert_eq!(stats.fail_ratio(), 0.0);
        assert_eq!(stats.total_requests(), 0);
    }

    #[test]
    fn test_fail_ratio_increases_with_failures() {
        let stats = RequestStats::default();
        for _ in 0..10 {
            stats.record(&ok("/", 5.0));
        }

        let mut previous = stats.fail_ratio();
        for n in 1..=20u64 {
            stats.record(&failed("/", "boom"));
            let ratio = stats.fail_ratio();
            assert!(ratio > previous);
            assert!((ratio - n as f64 / (10 + n) as f64).abs() < 1e-12);
            previous = ratio;
        }
    }

    #[test]
    fn test_snapshot_groups_by_type_and_name() {
        let stats = RequestStats::default();
        stats.record(&ok("/a", 10.0));
        stats.record(&ok("/a", 20.0));
        stats.record(&RequestEvent::new("POST", "/a").with_response_time(5.0));
        stats.record(&failed("/b", "timeout"));
        stats.record(&failed("/b", "timeout"));
        stats.record(&failed("/b", "reset"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.entries.len(), 3);
        assert_eq!(snapshot.entry("GET", "/a").unwrap().num_requests, 2);
        assert_eq!(snapshot.entry("POST", "/a").unwrap().num_requests, 1);
        assert_eq!(snapshot.entry("GET", "/b").unwrap().num_failures, 3);
        assert_eq!(snapshot.total.name, TOTAL_NAME);
        assert_eq!(snapshot.total.num_requests, 6);
        assert_eq!(snapshot.total.num_failures, 3);

        assert_eq!(snapshot.errors.len(), 2);
        assert_eq!(snapshot.errors[0].error, "timeout");
        assert_eq!(snapshot.errors[0].occurrences, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = RequestStats::default();
        stats.record(&failed("/", "boom"));
        stats.reset();

        let snapshot = stats.snapshot();
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.errors.is_empty());
        assert_eq!(snapshot.total.num_requests, 0);
        assert_eq!(stats.fail_ratio(), 0.0);
    }

    #[test]
    fn test_take_delta_drains() {
        let stats = RequestStats::default();
        stats.record(&ok("/", 1.0));
        stats.record(&failed("/", "boom"));

        let delta = stats.take_delta();
        assert_eq!(delta.entries.len(), 1);
        assert_eq!(delta.entries[0].num_requests, 2);
        assert_eq!(delta.errors.len(), 1);

        assert_eq!(stats.total_requests(), 0);
        assert!(stats.take_delta().is_empty());
    }

    #[test]
    fn test_merge_delta_from_several_workers() {
        let master = RequestStats::default();

        for worker in 0..3 {
            let local = RequestStats::default();
            for _ in 0..4 {
                local.record(&ok("/", 2.0));
            }
            if worker == 0 {
                local.record(&failed("/", "boom"));
            }
            let delta = local.take_delta();
            let wire = serde_json::to_string(&delta).unwrap();
            master.merge_delta(&serde_json::from_str(&wire).unwrap());
        }

        assert_eq!(master.total_requests(), 13);
        assert_eq!(master.total_failures(), 1);
        assert!((master.fail_ratio() - 1.0 / 13.0).abs() < 1e-12);

        let snapshot = master.snapshot();
        assert_eq!(snapshot.entry("GET", "/").unwrap().num_requests, 13);
        assert_eq!(snapshot.errors[0].occurrences, 1);
    }

    #[test]
    fn test_concurrent_record() {
        let stats = Arc::new(RequestStats::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        if i % 5 == 0 {
                            stats.record(&failed("/", "boom"));
                        } else {
                            stats.record(&ok("/", 1.0));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.total_requests(), 4_000);
        assert_eq!(stats.total_failures(), 800);
        assert!((stats.fail_ratio() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_stats_listener_records_fired_events() {
        let events = Events::new();
        let stats = Arc::new(RequestStats::default());
        events.request.add_listener(StatsListener(Arc::clone(&stats)));

        events.fire_request(&ok("/", 3.0));
        events.fire_request(&failed("/", "boom"));

        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.fail_ratio(), 0.5);
    }
}
