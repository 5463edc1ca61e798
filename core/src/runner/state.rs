//! Run states and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a runner, or the reported state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Idle, ready for a start command
    Ready,
    /// Ramping users toward the target
    Spawning,
    /// Target reached
    Running,
    /// Users are finishing their current iteration
    Stopping,
    /// No users running
    Stopped,
    /// Releasing resources before going back to ready
    Cleanup,
    /// Worker stopped sending heartbeats (master side only)
    Missing,
}

impl RunState {
    /// Whether `self -> next` is a legal transition
    ///
    /// Any state may move to `Stopped`, which is how fatal errors end a run.
    /// `Missing` is a liveness marker and never a transition target.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (_, Stopped) => true,
            (Ready, Spawning) => true,
            (Spawning, Spawning) | (Spawning, Running) => true,
            (Running, Spawning) => true,
            (Spawning, Stopping) | (Running, Stopping) => true,
            (Stopped, Cleanup) | (Stopped, Ready) => true,
            (Cleanup, Ready) => true,
            _ => false,
        }
    }

    /// Users are (or are about to be) executing
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Spawning | RunState::Running)
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Ready => "ready",
            RunState::Spawning => "spawning",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
            RunState::Cleanup => "cleanup",
            RunState::Missing => "missing",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
