//! Periodic stats reporting

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::runner::{RunState, Runner};

use super::aggregator::{RequestStats, StatsSnapshot};

/// One periodic report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFrame {
    /// Runner state when the frame was taken
    pub state: RunState,
    /// Active users
    pub user_count: usize,
    /// Statistics
    pub snapshot: StatsSnapshot,
}

/// Emits a [`ReportFrame`] every interval until shut down
///
/// Consumers (CSV writers, a UI) read frames from the receiving end of the
/// channel; a full channel delays the reporter instead of dropping frames.
pub struct StatsReporter {
    stats: Arc<RequestStats>,
    runner: Arc<dyn Runner>,
    interval: Duration,
}

impl StatsReporter {
    /// Create a reporter over `stats` and `runner`
    pub fn new(stats: Arc<RequestStats>, runner: Arc<dyn Runner>, interval: Duration) -> Self {
        Self {
            stats,
            runner,
            interval,
        }
    }

    /// Build a frame now
    pub fn frame(&self) -> ReportFrame {
        let status = self.runner.status();
        ReportFrame {
            state: status.state,
            user_count: status.user_count,
            snapshot: self.stats.snapshot(),
        }
    }

    /// Run the report loop in a background task
    pub fn spawn(
        self,
        tx: mpsc::Sender<ReportFrame>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.recv() => {
                        tracing::debug!("Stats reporter received shutdown signal");
                        break;
                    }

                    _ = ticker.tick() => {
                        if tx.send(self.frame()).await.is_err() {
                            tracing::debug!("Report channel closed, reporter stopping");
                            break;
                        }
                    }
                }
            }

            // Final frame so consumers always see the end state
            let _ = tx.send(self.frame()).await;
        })
    }
}

impl std::fmt::Debug for StatsReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsReporter")
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::events::RequestEvent;
    use crate::runner::{IterationResult, User, UserClass, UserContext};
    use crate::Environment;
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl User for Idle {
        async fn run(&mut self, _ctx: &UserContext) -> IterationResult {
            Ok(())
        }

        fn wait_time(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_emits_frames_until_shutdown() {
        let env = Environment::builder()
            .config(RunConfig::default())
            .user_class(UserClass::from_fn("idle", || Idle))
            .build()
            .unwrap();
        let runner: Arc<dyn Runner> = Arc::new(env.local_runner().unwrap());
        env.events()
            .fire_request(&RequestEvent::new("GET", "/").with_response_time(4.0));

        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = StatsReporter::new(env.stats(), runner, Duration::from_secs(2))
            .spawn(tx, shutdown_rx);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.state, RunState::Ready);
        assert_eq!(frame.user_count, 0);
        assert_eq!(frame.snapshot.total.num_requests, 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // Drain the final frame, then the channel is closed
        let mut last = None;
        while let Some(frame) = rx.recv().await {
            last = Some(frame);
        }
        assert!(last.is_some());
    }
}
