//! loadhive-core: run coordination for distributed load generation
//!
//! This crate provides the pieces every loadhive process is built from:
//!
//! - Event hooks for request and lifecycle events
//! - Request stats aggregation with worker deltas
//! - The runner state machine with local, master and worker runners
//! - The master/worker wire protocol and its transports
//! - [`Environment`], which binds all of the above for one run
//!
//! # Example
//!
//! ```no_run
//! use loadhive_core::{Environment, IterationResult, RunConfig, Runner, User, UserClass, UserContext};
//! use async_trait::async_trait;
//!
//! struct Browse;
//!
//! #[async_trait]
//! impl User for Browse {
//!     async fn run(&mut self, ctx: &UserContext) -> IterationResult {
//!         ctx.track("GET", "/", async { Ok::<_, std::io::Error>(()) }).await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> loadhive_core::RunResult<()> {
//! let env = Environment::builder()
//!     .config(RunConfig::default())
//!     .user_class(UserClass::from_fn("browse", || Browse))
//!     .build()?;
//! let runner = env.local_runner()?;
//! runner.start(10, 2.0).await?;
//! runner.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod protocol;
pub mod runner;
pub mod stats;
pub mod transport;

pub use channel::ChannelConfig;
pub use config::{ConfigError, HeartbeatConfig, RunConfig, SpawnConfig, StatsConfig};
pub use environment::{generate_worker_id, Environment, EnvironmentBuilder};
pub use error::{ErrorKind, ListenerError, RunError, RunResult};
pub use events::{
    Context, DispatchPolicy, EventHook, Events, LifecycleEvent, LifecycleKind, Listener,
    ListenerId, RequestEvent,
};
pub use protocol::{Envelope, Message, PROTOCOL_VERSION};
pub use runner::{
    BoxError, IterationResult, LocalRunner, MasterRunner, RunState, Runner, RunnerStatus, User,
    UserClass, UserContext, WorkerRunner, WorkerSummary,
};
pub use stats::{RequestStats, StatsDelta, StatsReporter, StatsSnapshot, TOTAL_NAME};
pub use transport::{connect_tcp, memory_hub, Acceptor, Link, TcpAcceptor};
