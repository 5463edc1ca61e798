//! State and lifecycle bookkeeping shared by every runner

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::RunConfig;
use crate::error::{RunError, RunResult};
use crate::events::{Events, LifecycleEvent, LifecycleKind};
use crate::stats::RequestStats;

use super::state::RunState;

/// The authoritative state of one runner plus the services it reports to
pub(crate) struct RunnerCore {
    pub(crate) events: Arc<Events>,
    pub(crate) stats: Arc<RequestStats>,
    pub(crate) config: RunConfig,
    state_tx: watch::Sender<RunState>,
    last_error: Mutex<Option<RunError>>,
    /// Set between `test_start` and `test_stop`
    run_active: AtomicBool,
    quitting: AtomicBool,
}

impl RunnerCore {
    pub(crate) fn new(events: Arc<Events>, stats: Arc<RequestStats>, config: RunConfig) -> Self {
        let (state_tx, _) = watch::channel(RunState::Ready);
        Self {
            events,
            stats,
            config,
            state_tx,
            last_error: Mutex::new(None),
            run_active: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Move to `next`; a transition to the current state is a no-op
    pub(crate) fn transition(&self, next: RunState) -> RunResult<()> {
        let mut outcome = Ok(());
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                outcome = Err(RunError::invalid_state(format!(
                    "cannot move from {state} to {next}"
                )));
                return false;
            }
            tracing::info!(from = %state, to = %next, "Runner state changed");
            *state = next;
            true
        });
        outcome
    }

    /// Move `from -> next` only if the runner is still in `from`
    pub(crate) fn transition_from(&self, from: RunState, next: RunState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state != from || !from.can_transition_to(next) || from == next {
                return false;
            }
            tracing::info!(from = %state, to = %next, "Runner state changed");
            *state = next;
            true
        })
    }

    pub(crate) fn last_error(&self) -> Option<RunError> {
        self.last_error.lock().clone()
    }

    pub(crate) fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    /// Fire `test_start` and mark a run as in progress
    pub(crate) fn begin_run(&self, fields: Map<String, Value>) -> RunResult<()> {
        *self.last_error.lock() = None;
        self.events.fire_lifecycle(LifecycleKind::TestStart, fields)?;
        self.run_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Fire `test_stop` once per run
    pub(crate) fn finish_run(&self, user_count: usize, error: Option<&RunError>) -> RunResult<()> {
        if !self.run_active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut event = LifecycleEvent::new(LifecycleKind::TestStop)
            .with_field("user_count", user_count as u64)
            .with_field("fail_ratio", self.stats.fail_ratio());
        if let Some(err) = error {
            event = event.with_error(err.to_string());
        }
        self.events.fire_lifecycle_event(&event)
    }

    /// Record a fatal error and force the runner to `Stopped`
    ///
    /// The caller is responsible for stopping users first.
    pub(crate) fn fail(&self, err: RunError, user_count: usize) {
        tracing::error!(kind = %err.kind, error = %err.message, "Run failed");
        *self.last_error.lock() = Some(err.clone());
        // Stopped is reachable from every state
        let _ = self.transition(RunState::Stopped);
        if let Err(e) = self.finish_run(user_count, Some(&err)) {
            tracing::error!(error = %e, "test_stop listener failed");
        }
    }

    /// Fire `spawning_complete`
    pub(crate) fn spawning_complete(&self, user_count: usize) -> RunResult<()> {
        let mut fields = Map::new();
        fields.insert("user_count".into(), (user_count as u64).into());
        self.events
            .fire_lifecycle(LifecycleKind::SpawningComplete, fields)
    }

    /// Mark the runner as quitting; returns true for the first caller only
    pub(crate) fn begin_quit(&self) -> bool {
        !self.quitting.swap(true, Ordering::SeqCst)
    }

    /// Fire `quitting`
    pub(crate) fn fire_quitting(&self) -> RunResult<()> {
        let event = LifecycleEvent::new(LifecycleKind::Quitting)
            .with_field("fail_ratio", self.stats.fail_ratio());
        self.events.fire_lifecycle_event(&event)
    }
}

impl std::fmt::Debug for RunnerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerCore")
            .field("state", &self.state())
            .field("quitting", &self.is_quitting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn core_with_recorder() -> (RunnerCore, Arc<Mutex<Vec<LifecycleEvent>>>) {
        let events = Arc::new(Events::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in LifecycleKind::ALL {
            let sink = Arc::clone(&seen);
            events
                .lifecycle(kind)
                .add_handler("recorder", move |event: &LifecycleEvent| {
                    sink.lock().push(event.clone());
                    Ok(())
                });
        }
        let stats = Arc::new(RequestStats::default());
        let core = RunnerCore::new(events, stats, RunConfig::default());
        (core, seen)
    }

    #[test]
    fn test_transition_validation() {
        let (core, _) = core_with_recorder();
        let mut rx = core.subscribe();

        core.transition(RunState::Spawning).unwrap();
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        // Same state: no-op, no notification
        core.transition(RunState::Spawning).unwrap();
        assert!(!rx.has_changed().unwrap());

        let err = core.transition(RunState::Ready).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(core.state(), RunState::Spawning);
    }

    #[test]
    fn test_transition_from_is_conditional() {
        let (core, _) = core_with_recorder();
        assert!(!core.transition_from(RunState::Spawning, RunState::Running));
        core.transition(RunState::Spawning).unwrap();
        assert!(core.transition_from(RunState::Spawning, RunState::Running));
        assert_eq!(core.state(), RunState::Running);
    }

    #[test]
    fn test_finish_run_fires_once() {
        let (core, seen) = core_with_recorder();
        core.begin_run(Map::new()).unwrap();
        core.finish_run(3, None).unwrap();
        core.finish_run(3, None).unwrap();

        let kinds: Vec<_> = seen.lock().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![LifecycleKind::TestStart, LifecycleKind::TestStop]);
    }

    #[test]
    fn test_fail_records_error_and_stops() {
        let (core, seen) = core_with_recorder();
        core.begin_run(Map::new()).unwrap();
        core.transition(RunState::Spawning).unwrap();

        core.fail(RunError::spawn("factory exploded"), 2);

        assert_eq!(core.state(), RunState::Stopped);
        assert_eq!(core.last_error().unwrap().kind, ErrorKind::Spawn);
        let seen = seen.lock();
        let stop = seen.last().unwrap();
        assert_eq!(stop.kind, LifecycleKind::TestStop);
        assert!(stop.error.as_deref().unwrap().contains("factory exploded"));
    }

    #[test]
    fn test_begin_quit_once() {
        let (core, _) = core_with_recorder();
        assert!(core.begin_quit());
        assert!(!core.begin_quit());
        assert!(core.is_quitting());
    }
}
