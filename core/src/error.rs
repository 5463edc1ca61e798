//! Error types for loadhive-core

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Classification of run-level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A registered listener failed during dispatch
    Listener,
    /// A user could not be instantiated
    Spawn,
    /// A worker stopped answering heartbeats
    WorkerUnreachable,
    /// A malformed or out-of-order control message
    Protocol,
    /// Invalid configuration or start parameters
    Config,
    /// The requested operation is not valid in the current run state
    InvalidState,
    /// The link to a peer failed
    Transport,
    /// The runner is shutting down
    Shutdown,
    /// IO failure
    Io,
}

impl ErrorKind {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Listener => "listener",
            ErrorKind::Spawn => "spawn",
            ErrorKind::WorkerUnreachable => "worker_unreachable",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Config => "config",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Transport => "transport",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Io => "io",
        }
    }

    /// Whether an error of this kind ends the run
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Spawn | ErrorKind::Listener)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct RunError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human readable detail
    pub message: String,
}

impl RunError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A listener on `hook` failed
    pub fn listener(hook: &str, listener: &str, message: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::Listener,
            format!("listener {listener} on {hook} failed: {message}"),
        )
    }

    /// A user could not be spawned
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Spawn, message)
    }

    /// A worker missed its heartbeat window
    pub fn worker_unreachable(worker_id: &str) -> Self {
        Self::new(
            ErrorKind::WorkerUnreachable,
            format!("worker {worker_id} missed its heartbeat window"),
        )
    }

    /// Malformed or out-of-order message
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// Invalid configuration
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// A required builder field was not provided
    pub fn missing_config(field: &str) -> Self {
        Self::new(ErrorKind::Config, format!("missing required field: {field}"))
    }

    /// Operation not valid in the current state
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    /// Link failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Runner is shutting down
    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "runner is shutting down")
    }
}

impl From<std::io::Error> for RunError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<serde_json::Error> for RunError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("invalid message encoding: {err}"))
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

/// Result type alias
pub type RunResult<T> = std::result::Result<T, RunError>;

/// Failure reported by an event listener
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    /// Create a listener error
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
