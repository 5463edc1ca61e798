//! Master-side view of connected workers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use super::RunState;

/// Worker liveness as judged from heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Heartbeats arrive on time
    Live,
    /// At least one heartbeat window missed, or the link dropped
    Missing,
    /// `max_missed` consecutive windows missed
    Dead,
}

/// One registered worker
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    /// Worker id
    pub worker_id: String,
    /// Last message of any kind from this worker
    pub last_heartbeat: Instant,
    /// State from the latest heartbeat
    pub reported_state: RunState,
    /// Users from the latest heartbeat
    pub user_count: usize,
    /// Liveness
    pub liveness: Liveness,
    /// Consecutive missed heartbeat windows
    pub missed_heartbeats: u32,
    /// Reported running since the last spawn instruction
    pub reached_running: bool,
    /// Acknowledged the current cleanup
    pub cleanup_acked: bool,
    /// Last error the worker reported
    pub last_error: Option<String>,
}

impl WorkerEntry {
    fn new(worker_id: String, now: Instant) -> Self {
        Self {
            worker_id,
            last_heartbeat: now,
            reported_state: RunState::Ready,
            user_count: 0,
            liveness: Liveness::Live,
            missed_heartbeats: 0,
            reached_running: false,
            cleanup_acked: false,
            last_error: None,
        }
    }

    /// Whether the worker counts toward quorums and shares
    pub fn is_live(&self) -> bool {
        self.liveness == Liveness::Live
    }

    /// State as shown to operators: `Missing` overrides the reported state
    pub fn effective_state(&self) -> RunState {
        match self.liveness {
            Liveness::Live => self.reported_state,
            Liveness::Missing | Liveness::Dead => RunState::Missing,
        }
    }
}

/// Users and spawn rate assigned to one worker
#[derive(Debug, Clone, PartialEq)]
pub struct Share {
    /// Worker id
    pub worker_id: String,
    /// Users this worker should run
    pub target_count: usize,
    /// This worker's part of the spawn rate
    pub spawn_rate: f64,
}

/// Result of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Known live worker updated
    Updated,
    /// A missing or dead worker came back
    Revived,
    /// Worker never registered
    Unknown,
}

/// Registered workers, ordered by id
///
/// Missing and dead workers stay listed for reporting but are excluded from
/// every quorum and from share computation.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerEntry>,
    timeout: Duration,
    max_missed: u32,
}

impl WorkerRegistry {
    /// Create a registry; a worker silent for `timeout` misses one window
    pub fn new(timeout: Duration, max_missed: u32) -> Self {
        Self {
            workers: BTreeMap::new(),
            timeout,
            max_missed: max_missed.max(1),
        }
    }

    /// Add a worker, or reset one that reconnects; returns true if new
    pub fn register(&mut self, worker_id: &str, now: Instant) -> bool {
        let fresh = WorkerEntry::new(worker_id.to_string(), now);
        self.workers.insert(worker_id.to_string(), fresh).is_none()
    }

    /// Apply a heartbeat
    pub fn heartbeat(
        &mut self,
        worker_id: &str,
        state: RunState,
        user_count: usize,
        now: Instant,
    ) -> HeartbeatOutcome {
        let Some(entry) = self.workers.get_mut(worker_id) else {
            return HeartbeatOutcome::Unknown;
        };
        entry.reported_state = state;
        entry.user_count = user_count;
        if state == RunState::Running {
            entry.reached_running = true;
        }
        Self::revive(entry, now)
    }

    /// Any message from a worker proves it is alive
    pub fn touch(&mut self, worker_id: &str, now: Instant) -> HeartbeatOutcome {
        match self.workers.get_mut(worker_id) {
            Some(entry) => Self::revive(entry, now),
            None => HeartbeatOutcome::Unknown,
        }
    }

    fn revive(entry: &mut WorkerEntry, now: Instant) -> HeartbeatOutcome {
        entry.last_heartbeat = now;
        entry.missed_heartbeats = 0;
        if entry.is_live() {
            HeartbeatOutcome::Updated
        } else {
            entry.liveness = Liveness::Live;
            HeartbeatOutcome::Revived
        }
    }

    /// Re-evaluate liveness; returns workers whose liveness changed
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<(String, Liveness)> {
        let timeout = self.timeout.as_nanos().max(1);
        let mut changed = Vec::new();
        for entry in self.workers.values_mut() {
            let silent = now.saturating_duration_since(entry.last_heartbeat).as_nanos();
            let missed = u32::try_from(silent / timeout).unwrap_or(u32::MAX);
            entry.missed_heartbeats = entry.missed_heartbeats.max(missed);

            let next = if entry.missed_heartbeats >= self.max_missed {
                Liveness::Dead
            } else if entry.missed_heartbeats >= 1 {
                Liveness::Missing
            } else {
                entry.liveness
            };
            if next != entry.liveness && entry.liveness != Liveness::Dead {
                entry.liveness = next;
                changed.push((entry.worker_id.clone(), next));
            }
        }
        changed
    }

    /// Mark a worker missing right away, e.g. after its link dropped
    pub fn mark_missing(&mut self, worker_id: &str) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(entry) if entry.is_live() => {
                entry.liveness = Liveness::Missing;
                entry.missed_heartbeats = entry.missed_heartbeats.max(1);
                true
            }
            _ => false,
        }
    }

    /// Record an error reported by a worker
    pub fn record_error(&mut self, worker_id: &str, message: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.last_error = Some(message.to_string());
        }
    }

    /// Record a cleanup acknowledgement
    pub fn ack_cleanup(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.cleanup_acked = true;
        }
    }

    /// Forget every cleanup acknowledgement
    pub fn reset_cleanup_acks(&mut self) {
        for entry in self.workers.values_mut() {
            entry.cleanup_acked = false;
        }
    }

    /// Forget every running report, before a new spawn instruction
    pub fn reset_reached_running(&mut self) {
        for entry in self.workers.values_mut() {
            entry.reached_running = false;
        }
    }

    /// Drop a worker entirely
    pub fn remove(&mut self, worker_id: &str) -> Option<WorkerEntry> {
        self.workers.remove(worker_id)
    }

    /// Look up a worker
    pub fn get(&self, worker_id: &str) -> Option<&WorkerEntry> {
        self.workers.get(worker_id)
    }

    /// All workers, ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers.values()
    }

    /// Live workers, ordered by id
    pub fn live(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers.values().filter(|entry| entry.is_live())
    }

    /// Registered workers, whatever their liveness
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker ever registered
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Live workers
    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Users across live workers
    pub fn user_count(&self) -> usize {
        self.live().map(|entry| entry.user_count).sum()
    }

    /// Every live worker reported running since the last spawn instruction
    /// and together they run exactly `target` users
    pub fn all_running(&self, target: usize) -> bool {
        self.live_count() > 0
            && self
                .live()
                .all(|entry| entry.reached_running && entry.reported_state == RunState::Running)
            && self.user_count() == target
    }

    /// No live worker runs users; true when no live worker remains
    pub fn all_stopped(&self) -> bool {
        self.live().all(|entry| {
            matches!(entry.reported_state, RunState::Stopped | RunState::Ready)
        })
    }

    /// Every live worker acknowledged cleanup; true when none remain
    pub fn all_acked(&self) -> bool {
        self.live().all(|entry| entry.cleanup_acked)
    }

    /// Split `target_count` and `spawn_rate` across live workers
    ///
    /// Workers are taken in id order and the first `target_count % n` get
    /// one extra user.
    pub fn shares(&self, target_count: usize, spawn_rate: f64) -> Vec<Share> {
        let live: Vec<&WorkerEntry> = self.live().collect();
        if live.is_empty() {
            return Vec::new();
        }
        let n = live.len();
        let base = target_count / n;
        let extra = target_count % n;
        let rate = spawn_rate / n as f64;

        live.into_iter()
            .enumerate()
            .map(|(idx, entry)| Share {
                worker_id: entry.worker_id.clone(),
                target_count: base + usize::from(idx < extra),
                spawn_rate: rate,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[&str], now: Instant) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new(Duration::from_secs(10), 3);
        for id in ids {
            assert!(registry.register(id, now));
        }
        registry
    }

    #[test]
    fn test_shares_split_remainder_to_first_workers() {
        let registry = registry_with(&["c", "a", "b"], Instant::now());
        let shares = registry.shares(10, 3.0);

        let ids: Vec<&str> = shares.iter().map(|s| s.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let counts: Vec<usize> = shares.iter().map(|s| s.target_count).collect();
        assert_eq!(counts, vec![4, 3, 3]);
        assert!(shares.iter().all(|s| (s.spawn_rate - 1.0).abs() < 1e-12));
        assert_eq!(counts.iter().sum::<usize>(), 10);
    }

    #[test]
    fn test_shares_empty_without_live_workers() {
        let mut registry = registry_with(&["a"], Instant::now());
        registry.mark_missing("a");
        assert!(registry.shares(10, 1.0).is_empty());
    }

    #[test]
    fn test_running_quorum_needs_every_live_worker() {
        let now = Instant::now();
        let mut registry = registry_with(&["a", "b", "c"], now);

        registry.heartbeat("a", RunState::Running, 4, now);
        registry.heartbeat("b", RunState::Running, 3, now);
        assert!(!registry.all_running(10));

        registry.heartbeat("c", RunState::Spawning, 2, now);
        assert!(!registry.all_running(10));

        registry.heartbeat("c", RunState::Running, 3, now);
        assert!(registry.all_running(10));
        assert!(!registry.all_running(11));
    }

    #[test]
    fn test_running_quorum_needs_report_after_new_instruction() {
        let now = Instant::now();
        let mut registry = registry_with(&["a", "b"], now);
        registry.heartbeat("a", RunState::Running, 2, now);
        registry.heartbeat("b", RunState::Running, 2, now);
        assert!(registry.all_running(4));

        // Rate-only rescale keeps the target; stale reports must not count
        registry.reset_reached_running();
        assert!(!registry.all_running(4));

        registry.heartbeat("a", RunState::Running, 2, now);
        assert!(!registry.all_running(4));
        registry.heartbeat("b", RunState::Running, 2, now);
        assert!(registry.all_running(4));
    }

    #[test]
    fn test_missing_worker_excluded_from_stopped_quorum() {
        let now = Instant::now();
        let mut registry = registry_with(&["a", "b", "c"], now);
        for id in ["a", "b", "c"] {
            registry.heartbeat(id, RunState::Running, 1, now);
        }

        assert!(registry.mark_missing("c"));
        assert!(!registry.mark_missing("c"));
        assert_eq!(registry.get("c").unwrap().effective_state(), RunState::Missing);

        registry.heartbeat("a", RunState::Stopped, 0, now);
        assert!(!registry.all_stopped());
        registry.heartbeat("b", RunState::Stopped, 0, now);
        assert!(registry.all_stopped());
    }

    #[test]
    fn test_timeouts_escalate_to_dead() {
        let start = Instant::now();
        let mut registry = registry_with(&["a", "b"], start);

        let later = start + Duration::from_secs(11);
        registry.heartbeat("b", RunState::Ready, 0, later);
        assert_eq!(
            registry.check_timeouts(later),
            vec![("a".to_string(), Liveness::Missing)]
        );
        assert_eq!(registry.live_count(), 1);

        // Still missing: no repeated change
        assert!(registry.check_timeouts(later).is_empty());

        let much_later = start + Duration::from_secs(31);
        registry.heartbeat("b", RunState::Ready, 0, much_later);
        assert_eq!(
            registry.check_timeouts(much_later),
            vec![("a".to_string(), Liveness::Dead)]
        );
    }

    #[test]
    fn test_heartbeat_revives_missing_worker() {
        let start = Instant::now();
        let mut registry = registry_with(&["a"], start);
        registry.check_timeouts(start + Duration::from_secs(15));
        assert_eq!(registry.live_count(), 0);

        let outcome = registry.heartbeat("a", RunState::Ready, 0, start + Duration::from_secs(16));
        assert_eq!(outcome, HeartbeatOutcome::Revived);
        assert_eq!(registry.live_count(), 1);
        assert_eq!(
            registry.heartbeat("ghost", RunState::Ready, 0, start),
            HeartbeatOutcome::Unknown
        );
    }

    #[test]
    fn test_vacuous_quorums() {
        let registry = WorkerRegistry::new(Duration::from_secs(1), 1);
        assert!(registry.all_stopped());
        assert!(registry.all_acked());
        assert!(!registry.all_running(0));
    }
}
