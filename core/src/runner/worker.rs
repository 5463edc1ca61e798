//! Distributed run coordination, worker side

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::ChannelConfig;
use crate::config::HeartbeatConfig;
use crate::error::{ErrorKind, RunError, RunResult};
use crate::protocol::{Message, SequenceTracker};
use crate::stats::RequestStats;
use crate::transport::{pump_outbound, FrameSource, Link};

use super::{LocalRunner, RunState, Runner, RunnerStatus};

struct WorkerInner {
    worker_id: String,
    local: LocalRunner,
    stats: Arc<RequestStats>,
    heartbeat: HeartbeatConfig,
    /// `None` once quitting; dropping it closes the link
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    connected: AtomicBool,
    last_contact: Mutex<Instant>,
    quitting: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs a share of a distributed run on behalf of a master
///
/// Wraps a [`LocalRunner`], applies the master's instructions to it and
/// reports state, user count and stats deltas back every heartbeat interval
/// and on every local state change.
#[derive(Clone)]
pub struct WorkerRunner {
    inner: Arc<WorkerInner>,
}

impl WorkerRunner {
    /// Register with the master over `link` and start serving it
    pub(crate) async fn connect(
        worker_id: String,
        local: LocalRunner,
        stats: Arc<RequestStats>,
        heartbeat: HeartbeatConfig,
        channels: &ChannelConfig,
        link: Link,
    ) -> RunResult<Self> {
        let Link { sink, source, peer } = link;
        let (tx, rx) = mpsc::channel(channels.outbound_buffer);
        tx.send(Message::Register)
            .await
            .map_err(|_| RunError::transport("outbound queue closed"))?;
        let writer = tokio::spawn(pump_outbound(worker_id.clone(), sink, rx));

        let (shutdown_tx, _) = broadcast::channel(1);
        let (closed_tx, _) = watch::channel(false);
        let worker = Self {
            inner: Arc::new(WorkerInner {
                worker_id,
                local,
                stats,
                heartbeat,
                outbound: Mutex::new(Some(tx)),
                connected: AtomicBool::new(true),
                last_contact: Mutex::new(Instant::now()),
                quitting: AtomicBool::new(false),
                shutdown_tx,
                closed_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let tasks = vec![
            writer,
            tokio::spawn(worker.clone().read_loop(source)),
            tokio::spawn(worker.clone().heartbeat_loop()),
            tokio::spawn(worker.clone().state_loop()),
        ];
        *worker.inner.tasks.lock() = tasks;
        tracing::info!(worker_id = %worker.inner.worker_id, master = %peer, "Worker connected");
        Ok(worker)
    }

    /// This worker's id
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Whether the master was heard from within the heartbeat timeout
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Active users
    pub fn user_count(&self) -> usize {
        self.inner.local.user_count()
    }

    /// Wait until the worker quit and closed its link
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn send(&self, message: Message) {
        let tx = self.inner.outbound.lock().clone();
        if let Some(tx) = tx {
            if tx.send(message).await.is_err() {
                tracing::debug!(worker_id = %self.inner.worker_id, "Outbound queue closed");
            }
        }
    }

    /// Ship stats recorded since the last report, then a heartbeat
    async fn report(&self, state: RunState) {
        let delta = self.inner.stats.take_delta();
        if !delta.is_empty() {
            self.send(Message::Stats { delta }).await;
        }
        let user_count = self.inner.local.user_count();
        self.send(Message::Heartbeat { state, user_count }).await;
    }

    async fn read_loop(self, mut source: Box<dyn FrameSource>) {
        let worker_id = self.inner.worker_id.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut tracker = SequenceTracker::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => return,

                frame = source.recv() => match frame {
                    Ok(Some(envelope)) => {
                        if let Err(e) = tracker.check(envelope.seq) {
                            tracing::warn!(worker_id = %worker_id, error = %e, "Dropping envelope");
                            continue;
                        }
                        *self.inner.last_contact.lock() = Instant::now();
                        if !self.inner.connected.swap(true, Ordering::SeqCst) {
                            tracing::info!(worker_id = %worker_id, "Master reachable again");
                        }
                        self.apply(envelope.message).await;
                    }
                    Ok(None) => {
                        tracing::warn!(worker_id = %worker_id, "Master closed the link");
                        break;
                    }
                    Err(e) if e.kind == ErrorKind::Protocol => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Dropping malformed frame");
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Master link failed");
                        break;
                    }
                },
            }
        }

        self.inner.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.quit().await {
            tracing::error!(worker_id = %worker_id, error = %e, "Quit after link loss failed");
        }
    }

    /// Apply one instruction from the master
    async fn apply(&self, message: Message) {
        let worker_id = &self.inner.worker_id;
        let local = &self.inner.local;
        match message {
            Message::Spawn {
                target_count,
                spawn_rate,
            } => {
                if let Err(e) = local.start(target_count, spawn_rate).await {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Spawn instruction rejected");
                    self.send(Message::error(&e)).await;
                }
            }
            Message::Stop => {
                if let Err(e) = local.stop().await {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Stop failed");
                }
            }
            Message::Quit => {
                tracing::info!(worker_id = %worker_id, "Quit requested by master");
                if let Err(e) = self.quit().await {
                    tracing::error!(worker_id = %worker_id, error = %e, "Quit failed");
                }
            }
            Message::Cleanup => match local.cleanup().await {
                Ok(()) => self.send(Message::CleanupAck).await,
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Cleanup failed");
                }
            },
            Message::Ack => {
                tracing::info!(worker_id = %worker_id, "Registration acknowledged");
            }
            Message::Heartbeat { .. } => {}
            other => {
                let err = RunError::protocol(format!("unexpected {} from master", other.kind()));
                tracing::warn!(worker_id = %worker_id, error = %err, "Ignoring message");
            }
        }
    }

    async fn heartbeat_loop(self) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.inner.heartbeat.interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                _ = ticker.tick() => {
                    self.report(self.inner.local.state()).await;

                    let silent = self.inner.last_contact.lock().elapsed();
                    if silent > self.inner.heartbeat.timeout()
                        && self.inner.connected.swap(false, Ordering::SeqCst)
                    {
                        tracing::warn!(
                            worker_id = %self.inner.worker_id,
                            silent_secs = silent.as_secs_f64(),
                            "No contact with master, marking disconnected"
                        );
                    }
                }
            }
        }
    }

    /// Report every local transition right away
    async fn state_loop(self) {
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut state_rx = self.inner.local.subscribe_state();
        let mut reported_error: Option<RunError> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    self.report(state).await;
                    match state {
                        RunState::Stopped => {
                            if let Some(err) = self.inner.local.last_error() {
                                if reported_error.as_ref() != Some(&err) {
                                    self.send(Message::error(&err)).await;
                                    reported_error = Some(err);
                                }
                            }
                        }
                        RunState::Spawning => reported_error = None,
                        _ => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Runner for WorkerRunner {
    async fn start(&self, target_count: usize, spawn_rate: f64) -> RunResult<()> {
        self.inner.local.start(target_count, spawn_rate).await
    }

    async fn stop(&self) -> RunResult<()> {
        self.inner.local.stop().await
    }

    /// Stop users, send a final report and close the link
    async fn quit(&self) -> RunResult<()> {
        if self.inner.quitting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.inner.local.quit().await;
        self.report(self.inner.local.state()).await;

        // The writer drains what is queued, then closes the link
        self.inner.outbound.lock().take();
        self.inner.connected.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());
        self.inner.tasks.lock().clear();
        self.inner.closed_tx.send_replace(true);
        tracing::info!(worker_id = %self.inner.worker_id, "Worker quit");
        result
    }

    async fn cleanup(&self) -> RunResult<()> {
        self.inner.local.cleanup().await
    }

    fn status(&self) -> RunnerStatus {
        self.inner.local.status()
    }

    fn state(&self) -> RunState {
        self.inner.local.state()
    }

    fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.inner.local.subscribe_state()
    }

    fn last_error(&self) -> Option<RunError> {
        self.inner.local.last_error()
    }
}

impl std::fmt::Debug for WorkerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("worker_id", &self.inner.worker_id)
            .field("connected", &self.is_connected())
            .field("local", &self.inner.local)
            .finish()
    }
}
