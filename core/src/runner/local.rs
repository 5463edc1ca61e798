//! Single-process runner

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Map;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::validate_spawn_params;
use crate::error::{RunError, RunResult};

use super::monitor::{spawn_fail_ratio_monitor, spawn_run_time_monitor};
use super::pool::{join_users, UserPool};
use super::{RunState, Runner, RunnerCore, RunnerStatus};

/// Most spawn ticks per second; faster rates spawn in batches
const MAX_TICKS_PER_SEC: f64 = 1_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SpawnPlan {
    target_count: usize,
    spawn_rate: f64,
}

/// Tick period and users per tick for `spawn_rate` users per second
fn ramp_schedule(spawn_rate: f64) -> (Duration, usize) {
    let batch = (spawn_rate / MAX_TICKS_PER_SEC).floor().max(1.0);
    (Duration::from_secs_f64(batch / spawn_rate), batch as usize)
}

struct LocalInner {
    core: RunnerCore,
    pool: Mutex<UserPool>,
    /// Serializes start, stop and cleanup
    control: tokio::sync::Mutex<()>,
    plan: Mutex<SpawnPlan>,
    ramp: Mutex<Option<JoinHandle<()>>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    run_id: AtomicU64,
    monitors_enabled: bool,
}

/// Runs users inside this process
///
/// Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct LocalRunner {
    inner: Arc<LocalInner>,
}

impl LocalRunner {
    pub(crate) fn new(core: RunnerCore, pool: UserPool, monitors_enabled: bool) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                core,
                pool: Mutex::new(pool),
                control: tokio::sync::Mutex::new(()),
                plan: Mutex::new(SpawnPlan::default()),
                ramp: Mutex::new(None),
                monitors: Mutex::new(Vec::new()),
                run_id: AtomicU64::new(0),
                monitors_enabled,
            }),
        }
    }

    /// Active users
    pub fn user_count(&self) -> usize {
        self.inner.pool.lock().len()
    }

    /// Active users per class name
    pub fn user_class_counts(&self) -> Vec<(String, usize)> {
        self.inner.pool.lock().class_counts()
    }

    fn spawn_monitors(&self) {
        let config = &self.inner.core.config;
        let mut monitors = self.inner.monitors.lock();
        if let Some(threshold) = config.fail_ratio_threshold {
            monitors.push(spawn_fail_ratio_monitor(
                self.clone(),
                Arc::clone(&self.inner.core.stats),
                threshold,
                config.stats.check_interval(),
            ));
        }
        if let Some(run_time) = config.run_time() {
            monitors.push(spawn_run_time_monitor(self.clone(), run_time));
        }
    }

    fn abort_background(&self) {
        if let Some(ramp) = self.inner.ramp.lock().take() {
            ramp.abort();
        }
        for monitor in self.inner.monitors.lock().drain(..) {
            monitor.abort();
        }
    }

    /// Ramp toward `target` users, then report running
    async fn ramp(self, run_id: u64, target: usize, spawn_rate: f64) {
        let inner = &self.inner;

        let surplus: Vec<JoinHandle<()>> = {
            let mut pool = inner.pool.lock();
            let excess = pool.len().saturating_sub(target);
            (0..excess).filter_map(|_| pool.stop_one()).collect()
        };
        if !surplus.is_empty() {
            tracing::info!(count = surplus.len(), target, "Stopping surplus users");
            join_users(surplus).await;
        }

        let (period, batch) = ramp_schedule(spawn_rate);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let missing = target.saturating_sub(inner.pool.lock().len());
            if missing == 0 {
                break;
            }
            ticker.tick().await;

            for _ in 0..batch.min(missing) {
                match self.spawn_with_retry().await {
                    Ok(true) => {}
                    // Run was stopped under us
                    Ok(false) => return,
                    Err(e) => {
                        let runner = self.clone();
                        tokio::spawn(async move { runner.fail(run_id, e).await });
                        return;
                    }
                }
            }
        }

        if inner.core.transition_from(RunState::Spawning, RunState::Running) {
            let user_count = inner.pool.lock().len();
            tracing::info!(user_count, "All users spawned");
            if let Err(e) = inner.core.spawning_complete(user_count) {
                let runner = self.clone();
                tokio::spawn(async move { runner.fail(run_id, e).await });
            }
        }
    }

    /// Spawn one user, retrying with exponential backoff
    ///
    /// Returns `Ok(false)` when the runner left `Spawning` meanwhile.
    async fn spawn_with_retry(&self) -> RunResult<bool> {
        let spawn = &self.inner.core.config.spawn;
        let mut attempt = 0;
        loop {
            let result = {
                let mut pool = self.inner.pool.lock();
                // Checked under the pool lock so stop never misses a user
                if self.inner.core.state() != RunState::Spawning {
                    return Ok(false);
                }
                pool.spawn_one()
            };

            match result {
                Ok(()) => return Ok(true),
                Err(e) if attempt < spawn.retry_attempts => {
                    let base = spawn.backoff(attempt);
                    let jitter_ms =
                        rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
                    let delay = base + Duration::from_millis(jitter_ms);
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "User spawn failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// End run `run_id` with a fatal error
    async fn fail(&self, run_id: u64, err: RunError) {
        let _control = self.inner.control.lock().await;
        let current = self.inner.run_id.load(Ordering::SeqCst) == run_id;
        if !current || !self.inner.core.state().is_active() {
            tracing::debug!(error = %err, "Ignoring failure of a finished run");
            return;
        }
        self.abort_background();
        let tasks = self.inner.pool.lock().stop_all();
        let user_count = tasks.len();
        join_users(tasks).await;
        self.inner.core.fail(err, user_count);
    }

    async fn stop_locked(&self) -> RunResult<()> {
        let core = &self.inner.core;
        if !core.state().is_active() {
            tracing::debug!(state = %core.state(), "Stop ignored, no active run");
            return Ok(());
        }

        self.abort_background();
        core.transition(RunState::Stopping)?;
        let tasks = self.inner.pool.lock().stop_all();
        let user_count = tasks.len();
        tracing::info!(user_count, "Stopping users");
        join_users(tasks).await;

        core.transition(RunState::Stopped)?;
        tracing::info!(
            user_count,
            fail_ratio = core.stats.fail_ratio(),
            "All users stopped"
        );
        core.finish_run(user_count, None)
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn start(&self, target_count: usize, spawn_rate: f64) -> RunResult<()> {
        validate_spawn_params(target_count, spawn_rate)?;

        let _control = self.inner.control.lock().await;
        let core = &self.inner.core;
        if core.is_quitting() {
            return Err(RunError::shutdown());
        }

        let plan = SpawnPlan {
            target_count,
            spawn_rate,
        };
        let mut state = core.state();
        match state {
            RunState::Spawning | RunState::Running if *self.inner.plan.lock() == plan => {
                tracing::debug!(target_count, spawn_rate, "Start ignored, plan unchanged");
                return Ok(());
            }
            RunState::Stopped => {
                // Restart without an explicit cleanup
                core.transition(RunState::Ready)?;
                state = RunState::Ready;
            }
            RunState::Stopping | RunState::Cleanup | RunState::Missing => {
                return Err(RunError::invalid_state(format!("cannot start while {state}")));
            }
            _ => {}
        }

        if state == RunState::Ready {
            core.stats.reset();
            let run_id = self.inner.run_id.fetch_add(1, Ordering::SeqCst) + 1;
            let mut fields = Map::new();
            fields.insert("target_count".into(), (target_count as u64).into());
            fields.insert("spawn_rate".into(), spawn_rate.into());
            if let Err(e) = core.begin_run(fields) {
                core.fail(e.clone(), 0);
                return Err(e);
            }
            tracing::info!(run_id, target_count, spawn_rate, "Run started");
            if self.inner.monitors_enabled {
                self.spawn_monitors();
            }
        } else {
            tracing::info!(target_count, spawn_rate, "Rescaling run");
        }

        if let Some(previous) = self.inner.ramp.lock().take() {
            previous.abort();
        }
        *self.inner.plan.lock() = plan;
        core.transition(RunState::Spawning)?;

        let run_id = self.inner.run_id.load(Ordering::SeqCst);
        let ramp = tokio::spawn(self.clone().ramp(run_id, target_count, spawn_rate));
        *self.inner.ramp.lock() = Some(ramp);
        Ok(())
    }

    async fn stop(&self) -> RunResult<()> {
        let _control = self.inner.control.lock().await;
        self.stop_locked().await
    }

    async fn quit(&self) -> RunResult<()> {
        if !self.inner.core.begin_quit() {
            return Ok(());
        }
        tracing::info!("Quitting");
        let stopped = self.stop().await;
        let fired = self.inner.core.fire_quitting();
        stopped.and(fired)
    }

    async fn cleanup(&self) -> RunResult<()> {
        let _control = self.inner.control.lock().await;
        let core = &self.inner.core;
        match core.state() {
            RunState::Ready => Ok(()),
            RunState::Stopped => {
                core.transition(RunState::Cleanup)?;
                self.abort_background();
                *self.inner.plan.lock() = SpawnPlan::default();
                core.transition(RunState::Ready)
            }
            state => Err(RunError::invalid_state(format!(
                "cleanup requires a stopped runner, runner is {state}"
            ))),
        }
    }

    fn status(&self) -> RunnerStatus {
        RunnerStatus {
            state: self.inner.core.state(),
            user_count: self.user_count(),
            target_count: self.inner.plan.lock().target_count,
            fail_ratio: self.inner.core.stats.fail_ratio(),
        }
    }

    fn state(&self) -> RunState {
        self.inner.core.state()
    }

    fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.inner.core.subscribe()
    }

    fn last_error(&self) -> Option<RunError> {
        self.inner.core.last_error()
    }
}

impl std::fmt::Debug for LocalRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunner")
            .field("state", &self.inner.core.state())
            .field("user_count", &self.user_count())
            .field("plan", &*self.inner.plan.lock())
            .finish()
    }
}
