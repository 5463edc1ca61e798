//! Distributed run coordination, master side

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::ChannelConfig;
use crate::config::validate_spawn_params;
use crate::error::{ErrorKind, RunError, RunResult};
use crate::protocol::{Message, SequenceTracker};
use crate::transport::{pump_outbound, Acceptor, Link};

use super::monitor::{spawn_fail_ratio_monitor, spawn_run_time_monitor};
use super::registry::{HeartbeatOutcome, Liveness, WorkerRegistry};
use super::{RunState, Runner, RunnerCore, RunnerStatus};

/// Pause before accepting again after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What the master wants its workers to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Idle,
    Spawn,
    Stop,
    Cleanup,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DesiredState {
    command: Command,
    target_count: usize,
    spawn_rate: f64,
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            command: Command::Idle,
            target_count: 0,
            spawn_rate: 0.0,
        }
    }
}

/// Operator view of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Worker id
    pub worker_id: String,
    /// Reported state, `Missing` when not live
    pub state: RunState,
    /// Heartbeat liveness
    pub liveness: Liveness,
    /// Users from the last heartbeat
    pub user_count: usize,
    /// Last error the worker reported
    pub last_error: Option<String>,
}

struct WorkerLink {
    conn_id: u64,
    tx: mpsc::Sender<Message>,
}

enum Inbound {
    Connected {
        worker_id: String,
        conn_id: u64,
        tx: mpsc::Sender<Message>,
    },
    Message {
        worker_id: String,
        message: Message,
    },
    Disconnected {
        worker_id: String,
        conn_id: u64,
    },
}

struct MasterInner {
    core: RunnerCore,
    channels: ChannelConfig,
    local_addr: String,
    registry: Mutex<WorkerRegistry>,
    links: Mutex<HashMap<String, WorkerLink>>,
    desired: Mutex<DesiredState>,
    /// Serializes start, stop and cleanup
    control: tokio::sync::Mutex<()>,
    live_tx: watch::Sender<usize>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    next_conn_id: AtomicU64,
}

/// Splits a run across remote workers
///
/// The master runs no users itself. It keeps the desired state, hands every
/// live worker its share and derives the aggregate state from worker
/// heartbeats:
///
/// - `running` once every live worker runs and together they run the target
/// - `stopped` once every live worker stopped, or none is left
///
/// Workers that miss heartbeats or drop their link are excluded and their
/// users are rebalanced across the rest.
#[derive(Clone)]
pub struct MasterRunner {
    inner: Arc<MasterInner>,
}

impl MasterRunner {
    pub(crate) fn new(core: RunnerCore, acceptor: Box<dyn Acceptor>, channels: ChannelConfig) -> Self {
        let heartbeat = &core.config.heartbeat;
        let registry = WorkerRegistry::new(heartbeat.timeout(), heartbeat.max_missed);
        let (live_tx, _) = watch::channel(0);
        let (shutdown_tx, _) = broadcast::channel(1);
        let local_addr = acceptor.local_addr();

        let master = Self {
            inner: Arc::new(MasterInner {
                core,
                channels,
                local_addr,
                registry: Mutex::new(registry),
                links: Mutex::new(HashMap::new()),
                desired: Mutex::new(DesiredState::default()),
                control: tokio::sync::Mutex::new(()),
                live_tx,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                monitors: Mutex::new(Vec::new()),
                next_conn_id: AtomicU64::new(1),
            }),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(master.inner.channels.inbound_buffer);
        let tasks = vec![
            tokio::spawn(master.clone().accept_loop(acceptor, inbound_tx)),
            tokio::spawn(master.clone().handle_loop(inbound_rx)),
            tokio::spawn(master.clone().heartbeat_loop()),
        ];
        *master.inner.tasks.lock() = tasks;
        tracing::info!(addr = %master.inner.local_addr, "Master listening for workers");
        master
    }

    /// Address workers connect to
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    /// Workers currently counted in quorums
    pub fn live_worker_count(&self) -> usize {
        self.inner.registry.lock().live_count()
    }

    /// Every worker that ever registered, ordered by id
    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.inner
            .registry
            .lock()
            .iter()
            .map(|entry| WorkerSummary {
                worker_id: entry.worker_id.clone(),
                state: entry.effective_state(),
                liveness: entry.liveness,
                user_count: entry.user_count,
                last_error: entry.last_error.clone(),
            })
            .collect()
    }

    /// Wait until at least `count` workers are live
    pub async fn wait_for_workers(&self, count: usize, timeout: Duration) -> RunResult<()> {
        let mut rx = self.inner.live_tx.subscribe();
        let joined = tokio::time::timeout(timeout, rx.wait_for(|live| *live >= count))
            .await
            .map(|waited| waited.map(|_| ()));
        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RunError::shutdown()),
            Err(_) => Err(RunError::new(
                ErrorKind::WorkerUnreachable,
                format!(
                    "only {} of {count} workers connected after {:.1}s",
                    self.live_worker_count(),
                    timeout.as_secs_f64()
                ),
            )),
        }
    }

    async fn accept_loop(self, mut acceptor: Box<dyn Acceptor>, inbound_tx: mpsc::Sender<Inbound>) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                accepted = acceptor.accept() => match accepted {
                    Ok(link) => {
                        tokio::spawn(self.clone().serve_link(link, inbound_tx.clone()));
                    }
                    Err(e) if e.kind == ErrorKind::Shutdown => {
                        tracing::debug!(error = %e, "Acceptor closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept worker");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// Read one worker link until it closes
    async fn serve_link(self, link: Link, inbound_tx: mpsc::Sender<Inbound>) {
        let Link {
            sink,
            mut source,
            peer,
        } = link;
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut tracker = SequenceTracker::new();
        let register_timeout = self.inner.core.config.heartbeat.timeout();

        let first = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            first = tokio::time::timeout(register_timeout, source.recv()) => first,
        };
        let worker_id = match first {
            Ok(Ok(Some(envelope))) if envelope.message == Message::Register => {
                // First frame of a link always passes
                let _ = tracker.check(envelope.seq);
                envelope.worker_id
            }
            Ok(Ok(Some(envelope))) => {
                tracing::warn!(
                    peer = %peer,
                    kind = envelope.message.kind(),
                    "Expected register as first message, dropping link"
                );
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to read register");
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer, "Timed out waiting for register");
                return;
            }
        };

        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.channels.outbound_buffer);
        tokio::spawn(pump_outbound(worker_id.clone(), sink, rx));
        let connected = Inbound::Connected {
            worker_id: worker_id.clone(),
            conn_id,
            tx,
        };
        if inbound_tx.send(connected).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                frame = source.recv() => match frame {
                    Ok(Some(envelope)) => {
                        if envelope.worker_id != worker_id {
                            tracing::warn!(
                                worker_id = %worker_id,
                                claimed = %envelope.worker_id,
                                "Envelope for another worker on this link, dropped"
                            );
                            continue;
                        }
                        if let Err(e) = tracker.check(envelope.seq) {
                            tracing::warn!(worker_id = %worker_id, error = %e, "Dropping envelope");
                            continue;
                        }
                        let message = Inbound::Message {
                            worker_id: worker_id.clone(),
                            message: envelope.message,
                        };
                        if inbound_tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::info!(worker_id = %worker_id, "Worker closed its link");
                        break;
                    }
                    Err(e) if e.kind == ErrorKind::Protocol => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Dropping malformed frame");
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Worker link failed");
                        break;
                    }
                },
            }
        }

        let _ = inbound_tx
            .send(Inbound::Disconnected { worker_id, conn_id })
            .await;
    }

    async fn handle_loop(self, mut inbound_rx: mpsc::Receiver<Inbound>) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                event = inbound_rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }
    }

    fn handle(&self, event: Inbound) {
        match event {
            Inbound::Connected {
                worker_id,
                conn_id,
                tx,
            } => {
                let is_new = self.inner.registry.lock().register(&worker_id, Instant::now());
                self.inner
                    .links
                    .lock()
                    .insert(worker_id.clone(), WorkerLink { conn_id, tx });
                tracing::info!(
                    worker_id = %worker_id,
                    reconnect = !is_new,
                    "Worker registered"
                );
                self.send_to(&worker_id, Message::Ack);
                self.membership_changed();
            }
            Inbound::Message { worker_id, message } => self.handle_message(&worker_id, message),
            Inbound::Disconnected { worker_id, conn_id } => {
                {
                    let mut links = self.inner.links.lock();
                    match links.get(&worker_id) {
                        // A newer link replaced this one
                        Some(link) if link.conn_id != conn_id => return,
                        _ => {
                            links.remove(&worker_id);
                        }
                    }
                }
                if self.inner.registry.lock().mark_missing(&worker_id) {
                    tracing::warn!(worker_id = %worker_id, "Worker disconnected, marked missing");
                    self.membership_changed();
                }
            }
        }
        self.evaluate();
    }

    fn handle_message(&self, worker_id: &str, message: Message) {
        let now = Instant::now();
        match message {
            Message::Heartbeat { state, user_count } => {
                let outcome = self
                    .inner
                    .registry
                    .lock()
                    .heartbeat(worker_id, state, user_count, now);
                self.after_contact(worker_id, outcome);
            }
            Message::Stats { delta } => {
                self.inner.core.stats.merge_delta(&delta);
                let outcome = self.inner.registry.lock().touch(worker_id, now);
                self.after_contact(worker_id, outcome);
            }
            Message::CleanupAck => {
                let outcome = {
                    let mut registry = self.inner.registry.lock();
                    registry.ack_cleanup(worker_id);
                    registry.touch(worker_id, now)
                };
                self.after_contact(worker_id, outcome);
            }
            Message::Error { kind, message } => {
                self.inner.registry.lock().record_error(worker_id, &message);
                let err = RunError::new(kind, format!("worker {worker_id}: {message}"));
                let runner = self.clone();
                tokio::spawn(async move { runner.fail(err).await });
            }
            Message::Register => {
                tracing::warn!(worker_id = %worker_id, "Duplicate register ignored");
            }
            other => {
                let err = RunError::protocol(format!("unexpected {} from worker", other.kind()));
                tracing::warn!(worker_id = %worker_id, error = %err, "Ignoring message");
            }
        }
    }

    fn after_contact(&self, worker_id: &str, outcome: HeartbeatOutcome) {
        match outcome {
            HeartbeatOutcome::Updated => {}
            HeartbeatOutcome::Revived => {
                tracing::info!(worker_id = %worker_id, "Worker is back");
                self.membership_changed();
            }
            HeartbeatOutcome::Unknown => {
                tracing::warn!(worker_id = %worker_id, "Message from unregistered worker");
            }
        }
    }

    /// Recompute shares after a worker joined, left or came back
    fn membership_changed(&self) {
        let live = self.inner.registry.lock().live_count();
        self.inner.live_tx.send_replace(live);

        let command = self.inner.desired.lock().command;
        if command == Command::Spawn
            && self
                .inner
                .core
                .transition_from(RunState::Running, RunState::Spawning)
        {
            tracing::info!(live_workers = live, "Rebalancing users across workers");
        }
        self.broadcast_instruction();
    }

    fn heartbeat_tick(&self) {
        let changes = self.inner.registry.lock().check_timeouts(Instant::now());
        for (worker_id, liveness) in &changes {
            match liveness {
                Liveness::Missing => {
                    let err = RunError::worker_unreachable(worker_id);
                    tracing::warn!(worker_id = %worker_id, error = %err, "Worker missing");
                }
                Liveness::Dead => {
                    tracing::error!(worker_id = %worker_id, "Worker presumed dead, dropping link");
                    self.inner.links.lock().remove(worker_id);
                }
                Liveness::Live => {}
            }
        }
        if changes.is_empty() {
            self.broadcast_instruction();
        } else {
            self.membership_changed();
        }
        self.send_heartbeats();
        self.evaluate();
    }

    async fn heartbeat_loop(self) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.inner.core.config.heartbeat.interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                _ = ticker.tick() => self.heartbeat_tick(),
            }
        }
    }

    /// Queue `message` for one worker without waiting
    ///
    /// A full queue drops the message; the next heartbeat resends the
    /// current instruction.
    fn send_to(&self, worker_id: &str, message: Message) {
        let links = self.inner.links.lock();
        let Some(link) = links.get(worker_id) else {
            return;
        };
        match link.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(
                    worker_id = %worker_id,
                    kind = message.kind(),
                    "Outbound queue full, message dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(worker_id = %worker_id, "Outbound queue closed");
            }
        }
    }

    /// Send every worker its part of the current instruction
    fn broadcast_instruction(&self) {
        let desired = *self.inner.desired.lock();
        let messages: Vec<(String, Message)> = {
            let registry = self.inner.registry.lock();
            match desired.command {
                Command::Idle => Vec::new(),
                Command::Spawn => registry
                    .shares(desired.target_count, desired.spawn_rate)
                    .into_iter()
                    .map(|share| {
                        let message = Message::Spawn {
                            target_count: share.target_count,
                            spawn_rate: share.spawn_rate,
                        };
                        (share.worker_id, message)
                    })
                    .collect(),
                Command::Stop => registry
                    .live()
                    .map(|entry| (entry.worker_id.clone(), Message::Stop))
                    .collect(),
                Command::Cleanup => registry
                    .live()
                    .filter(|entry| !entry.cleanup_acked)
                    .map(|entry| (entry.worker_id.clone(), Message::Cleanup))
                    .collect(),
                Command::Quit => registry
                    .iter()
                    .map(|entry| (entry.worker_id.clone(), Message::Quit))
                    .collect(),
            }
        };
        for (worker_id, message) in messages {
            self.send_to(&worker_id, message);
        }
    }

    fn send_heartbeats(&self) {
        let state = self.inner.core.state();
        let desired = *self.inner.desired.lock();
        let shares: HashMap<String, usize> = if desired.command == Command::Spawn {
            self.inner
                .registry
                .lock()
                .shares(desired.target_count, desired.spawn_rate)
                .into_iter()
                .map(|share| (share.worker_id, share.target_count))
                .collect()
        } else {
            HashMap::new()
        };
        let worker_ids: Vec<String> = self.inner.links.lock().keys().cloned().collect();
        for worker_id in worker_ids {
            let user_count = shares.get(&worker_id).copied().unwrap_or(0);
            self.send_to(&worker_id, Message::Heartbeat { state, user_count });
        }
    }

    /// Advance the aggregate state when the workers reached a quorum
    fn evaluate(&self) {
        let core = &self.inner.core;
        let desired = *self.inner.desired.lock();
        match core.state() {
            RunState::Spawning if desired.command == Command::Spawn => {
                let (running, user_count) = {
                    let registry = self.inner.registry.lock();
                    (registry.all_running(desired.target_count), registry.user_count())
                };
                if running && core.transition_from(RunState::Spawning, RunState::Running) {
                    tracing::info!(user_count, "All workers running");
                    if let Err(e) = core.spawning_complete(user_count) {
                        let runner = self.clone();
                        tokio::spawn(async move { runner.fail(e).await });
                    }
                }
            }
            RunState::Stopping => {
                let (stopped, user_count) = {
                    let registry = self.inner.registry.lock();
                    (registry.all_stopped(), registry.user_count())
                };
                if stopped && core.transition_from(RunState::Stopping, RunState::Stopped) {
                    self.finish_stopped(user_count);
                }
            }
            RunState::Cleanup => {
                if self.inner.registry.lock().all_acked()
                    && core.transition_from(RunState::Cleanup, RunState::Ready)
                {
                    tracing::info!("All workers cleaned up");
                }
            }
            _ => {}
        }
    }

    fn finish_stopped(&self, user_count: usize) {
        let core = &self.inner.core;
        tracing::info!(
            fail_ratio = core.stats.fail_ratio(),
            total_requests = core.stats.total_requests(),
            "All workers stopped"
        );
        if let Err(e) = core.finish_run(user_count, None) {
            tracing::error!(error = %e, "test_stop listener failed");
        }
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

    fn abort_monitors(&self) {
        for monitor in self.inner.monitors.lock().drain(..) {
            monitor.abort();
        }
    }

    fn set_command(&self, command: Command) {
        self.inner.desired.lock().command = command;
    }

    /// End the current run with a fatal error reported by a worker
    async fn fail(&self, err: RunError) {
        let _control = self.inner.control.lock().await;
        let state = self.inner.core.state();
        if !state.is_active() && state != RunState::Stopping {
            tracing::debug!(error = %err, "Ignoring failure outside an active run");
            return;
        }
        self.abort_monitors();
        self.set_command(Command::Stop);
        self.broadcast_instruction();
        let user_count = self.inner.registry.lock().user_count();
        self.inner.core.fail(err, user_count);
    }

    fn stop_locked(&self) -> RunResult<()> {
        let core = &self.inner.core;
        if !core.state().is_active() {
            tracing::debug!(state = %core.state(), "Stop ignored, no active run");
            return Ok(());
        }
        self.abort_monitors();
        self.set_command(Command::Stop);
        core.transition(RunState::Stopping)?;
        tracing::info!(
            live_workers = self.live_worker_count(),
            "Stopping workers"
        );
        self.broadcast_instruction();
        self.evaluate();
        Ok(())
    }

    /// Wait up to one heartbeat timeout to leave `from`, then force `from -> to`
    ///
    /// Returns true if the transition had to be forced.
    async fn settle(&self, from: RunState, to: RunState) -> bool {
        let mut rx = self.inner.core.subscribe();
        let timeout = self.inner.core.config.heartbeat.timeout();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|state| *state != from))
            .await
            .is_ok();
        if settled {
            return false;
        }
        tracing::warn!(
            from = %from,
            to = %to,
            timeout_secs = timeout.as_secs_f64(),
            "Workers did not confirm in time, forcing transition"
        );
        self.inner.core.transition_from(from, to)
    }

    fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        // Dropping the senders lets each writer flush and close its link
        self.inner.links.lock().clear();
        self.inner.tasks.lock().clear();
    }
}

#[async_trait]
impl Runner for MasterRunner {
    async fn start(&self, target_count: usize, spawn_rate: f64) -> RunResult<()> {
        validate_spawn_params(target_count, spawn_rate)?;

        let _control = self.inner.control.lock().await;
        let core = &self.inner.core;
        if core.is_quitting() {
            return Err(RunError::shutdown());
        }
        let live_workers = self.live_worker_count();
        if live_workers == 0 {
            return Err(RunError::invalid_state("no live workers connected"));
        }
        // Each worker ramps at its slice of the rate
        validate_spawn_params(target_count, spawn_rate / live_workers as f64)?;

        let mut state = core.state();
        {
            let desired = *self.inner.desired.lock();
            let unchanged = desired.command == Command::Spawn
                && desired.target_count == target_count
                && desired.spawn_rate == spawn_rate;
            match state {
                RunState::Spawning | RunState::Running if unchanged => {
                    tracing::debug!(target_count, spawn_rate, "Start ignored, plan unchanged");
                    return Ok(());
                }
                RunState::Stopped => {
                    core.transition(RunState::Ready)?;
                    state = RunState::Ready;
                }
                RunState::Stopping | RunState::Cleanup | RunState::Missing => {
                    return Err(RunError::invalid_state(format!("cannot start while {state}")));
                }
                _ => {}
            }
        }

        if state == RunState::Ready {
            core.stats.reset();
            let mut fields = Map::new();
            fields.insert("target_count".into(), (target_count as u64).into());
            fields.insert("spawn_rate".into(), spawn_rate.into());
            fields.insert("worker_count".into(), (live_workers as u64).into());
            if let Err(e) = core.begin_run(fields) {
                core.fail(e.clone(), 0);
                return Err(e);
            }
            tracing::info!(target_count, spawn_rate, live_workers, "Distributed run started");
            self.spawn_monitors();
        } else {
            tracing::info!(target_count, spawn_rate, "Rescaling distributed run");
        }

        *self.inner.desired.lock() = DesiredState {
            command: Command::Spawn,
            target_count,
            spawn_rate,
        };
        self.inner.registry.lock().reset_reached_running();
        core.transition(RunState::Spawning)?;
        self.broadcast_instruction();
        self.evaluate();
        Ok(())
    }

    async fn stop(&self) -> RunResult<()> {
        let _control = self.inner.control.lock().await;
        self.stop_locked()
    }

    async fn quit(&self) -> RunResult<()> {
        let core = &self.inner.core;
        if !core.begin_quit() {
            return Ok(());
        }
        tracing::info!("Quitting, stopping workers");
        let stopped = {
            let _control = self.inner.control.lock().await;
            self.stop_locked()
        };
        if core.state() == RunState::Stopping
            && self.settle(RunState::Stopping, RunState::Stopped).await
        {
            let user_count = self.inner.registry.lock().user_count();
            self.finish_stopped(user_count);
        }

        self.set_command(Command::Quit);
        self.broadcast_instruction();
        let fired = core.fire_quitting();
        self.abort_monitors();
        self.shutdown();
        stopped.and(fired)
    }

    async fn cleanup(&self) -> RunResult<()> {
        let _control = self.inner.control.lock().await;
        let core = &self.inner.core;
        match core.state() {
            RunState::Ready => Ok(()),
            RunState::Stopped => {
                core.transition(RunState::Cleanup)?;
                self.inner.registry.lock().reset_cleanup_acks();
                self.set_command(Command::Cleanup);
                self.broadcast_instruction();
                self.evaluate();
                self.settle(RunState::Cleanup, RunState::Ready).await;
                *self.inner.desired.lock() = DesiredState::default();
                Ok(())
            }
            state => Err(RunError::invalid_state(format!(
                "cleanup requires a stopped runner, runner is {state}"
            ))),
        }
    }

    fn status(&self) -> RunnerStatus {
        RunnerStatus {
            state: self.inner.core.state(),
            user_count: self.inner.registry.lock().user_count(),
            target_count: self.inner.desired.lock().target_count,
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

impl std::fmt::Debug for MasterRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterRunner")
            .field("addr", &self.inner.local_addr)
            .field("state", &self.inner.core.state())
            .field("live_workers", &self.live_worker_count())
            .field("desired", &*self.inner.desired.lock())
            .finish()
    }
}
