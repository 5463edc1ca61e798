//! Run coordination
//!
//! A [`Runner`] owns the run state machine:
//!
//! ```text
//! ready -> spawning <-> running -> stopping -> stopped -> cleanup -> ready
//!                                               stopped -> ready (restart)
//! any   -> stopped (fatal error)
//! ```
//!
//! [`LocalRunner`] drives users in this process. [`MasterRunner`] splits the
//! target across remote [`WorkerRunner`]s and derives its state from their
//! heartbeats.

mod base;
mod local;
mod master;
mod monitor;
mod pool;
mod rate;
mod registry;
mod state;
mod user;
mod worker;


pub use self::local::LocalRunner;
pub use self::master::{MasterRunner, WorkerSummary};
pub use self::rate::IterationRateLimiter;
pub use self::registry::{Liveness, Share, WorkerEntry, WorkerRegistry};
pub use self::state::RunState;
pub use self::user::{BoxError, IterationResult, User, UserClass, UserContext};
pub use self::worker::WorkerRunner;

pub(crate) use self::base::RunnerCore;
pub(crate) use self::pool::UserPool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{RunError, RunResult};

/// Point-in-time runner status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStatus {
    /// Current state
    pub state: RunState,
    /// Active users (across all live workers for a master)
    pub user_count: usize,
    /// Requested users
    pub target_count: usize,
    /// Fail ratio of the current run
    pub fail_ratio: f64,
}

/// Control surface shared by every runner
#[async_trait]
pub trait Runner: Send + Sync {
    /// Ramp toward `target_count` users at `spawn_rate` users per second
    ///
    /// Called while spawning or running this rescales the run. Invalid
    /// parameters fail with a config error before any state change.
    async fn start(&self, target_count: usize, spawn_rate: f64) -> RunResult<()>;

    /// Stop every user; idempotent
    async fn stop(&self) -> RunResult<()>;

    /// Stop and tear down; fires `quitting` once
    async fn quit(&self) -> RunResult<()>;

    /// Release run resources and go back to ready
    async fn cleanup(&self) -> RunResult<()>;

    /// Current status
    fn status(&self) -> RunnerStatus;

    /// Current state
    fn state(&self) -> RunState;

    /// Watch state changes
    fn subscribe_state(&self) -> watch::Receiver<RunState>;

    /// Error that ended the last run, if any
    fn last_error(&self) -> Option<RunError>;

    /// Wait until the runner reaches `target`
    async fn wait_for_state(&self, target: RunState) -> RunResult<()> {
        let mut rx = self.subscribe_state();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| RunError::shutdown())
    }
}
