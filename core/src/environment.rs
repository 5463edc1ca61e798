//! Composition root for one run
//!
//! An [`Environment`] owns the event hooks, the stats aggregator and the
//! configuration, and creates exactly one runner bound to them. Nothing in
//! this crate is global: everything a runner needs is passed in here.

use serde_json::Map;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::ChannelConfig;
use crate::config::RunConfig;
use crate::error::{RunError, RunResult};
use crate::events::{Events, LifecycleKind};
use crate::runner::{
    IterationRateLimiter, LocalRunner, MasterRunner, RunnerCore, UserClass, UserPool,
    WorkerRunner,
};
use crate::stats::{RequestStats, StatsListener};
use crate::transport::{Acceptor, Link};

/// Events, stats, config and user classes shared by one runner
pub struct Environment {
    config: RunConfig,
    channels: ChannelConfig,
    events: Arc<Events>,
    stats: Arc<RequestStats>,
    user_classes: Vec<UserClass>,
    runner_created: AtomicBool,
}

impl Environment {
    /// Start building an environment
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// Event hooks
    pub fn events(&self) -> &Arc<Events> {
        &self.events
    }

    /// Stats aggregator
    pub fn stats(&self) -> Arc<RequestStats> {
        Arc::clone(&self.stats)
    }

    /// Run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Registered user classes
    pub fn user_classes(&self) -> &[UserClass] {
        &self.user_classes
    }

    /// Runner that spawns users in this process
    pub fn local_runner(&self) -> RunResult<LocalRunner> {
        self.claim_runner("local")?;
        let runner = self.build_local(true)?;
        self.fire_init("local")?;
        Ok(runner)
    }

    /// Runner that coordinates workers connecting through `acceptor`
    ///
    /// Must be called from within a tokio runtime.
    pub async fn master_runner(&self, acceptor: Box<dyn Acceptor>) -> RunResult<MasterRunner> {
        self.claim_runner("master")?;
        let runner = MasterRunner::new(self.core(), acceptor, self.channels.clone());
        self.fire_init("master")?;
        Ok(runner)
    }

    /// Runner that serves a master over `link`, with a generated worker id
    pub async fn worker_runner(&self, link: Link) -> RunResult<WorkerRunner> {
        self.worker_runner_with_id(generate_worker_id(), link).await
    }

    /// Runner that serves a master over `link` as `worker_id`
    pub async fn worker_runner_with_id(
        &self,
        worker_id: impl Into<String>,
        link: Link,
    ) -> RunResult<WorkerRunner> {
        self.claim_runner("worker")?;
        // The master owns the stop conditions of a distributed run
        let local = self.build_local(false)?;
        self.fire_init("worker")?;
        WorkerRunner::connect(
            worker_id.into(),
            local,
            self.stats(),
            self.config.heartbeat.clone(),
            &self.channels,
            link,
        )
        .await
    }

    fn claim_runner(&self, kind: &str) -> RunResult<()> {
        if self.runner_created.swap(true, Ordering::SeqCst) {
            return Err(RunError::invalid_state(format!(
                "environment already has a runner, cannot create a {kind} runner"
            )));
        }
        Ok(())
    }

    fn core(&self) -> RunnerCore {
        RunnerCore::new(
            Arc::clone(&self.events),
            Arc::clone(&self.stats),
            self.config.clone(),
        )
    }

    fn build_local(&self, monitors_enabled: bool) -> RunResult<LocalRunner> {
        if self.user_classes.is_empty() {
            return Err(RunError::missing_config("user_class"));
        }
        let limiter = Arc::new(IterationRateLimiter::new(self.config.max_iteration_rate));
        let pool = UserPool::new(self.user_classes.clone(), Arc::clone(&self.events), limiter);
        Ok(LocalRunner::new(self.core(), pool, monitors_enabled))
    }

    fn fire_init(&self, runner: &str) -> RunResult<()> {
        let mut fields = Map::new();
        fields.insert("runner".into(), runner.into());
        self.events.fire_lifecycle(LifecycleKind::Init, fields)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let classes: Vec<&str> = self.user_classes.iter().map(|c| c.name()).collect();
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("user_classes", &classes)
            .field("runner_created", &self.runner_created.load(Ordering::SeqCst))
            .finish()
    }
}

/// Worker id unique across machines
pub fn generate_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4().simple())
}

/// Builder for [`Environment`]
#[derive(Default)]
pub struct EnvironmentBuilder {
    config: Option<RunConfig>,
    channels: Option<ChannelConfig>,
    user_classes: Vec<UserClass>,
}

impl EnvironmentBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run configuration (default: [`RunConfig::default`])
    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set channel sizes
    pub fn channel_config(mut self, channels: ChannelConfig) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Add a user class
    pub fn user_class(mut self, class: UserClass) -> Self {
        self.user_classes.push(class);
        self
    }

    /// Add several user classes
    pub fn user_classes(mut self, classes: impl IntoIterator<Item = UserClass>) -> Self {
        self.user_classes.extend(classes);
        self
    }

    /// Validate and build
    ///
    /// The stats listener is registered before anything else can subscribe,
    /// so it always sees request events first.
    pub fn build(self) -> RunResult<Environment> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if let Some(class) = self.user_classes.iter().find(|c| c.weight() == 0) {
            return Err(RunError::config(format!(
                "user class {} has weight 0",
                class.name()
            )));
        }

        let events = Arc::new(Events::new());
        let stats = Arc::new(RequestStats::new(config.stats.entry_settings()));
        events.request.add_listener(StatsListener(Arc::clone(&stats)));

        tracing::debug!(
            user_classes = self.user_classes.len(),
            "Environment created"
        );

        Ok(Environment {
            config,
            channels: self.channels.unwrap_or_default(),
            events,
            stats,
            user_classes: self.user_classes,
            runner_created: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::{LifecycleEvent, RequestEvent};
    use crate::runner::{IterationResult, RunState, Runner, User, UserContext};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Idle;

    #[async_trait]
    impl User for Idle {
        async fn run(&mut self, _ctx: &UserContext) -> IterationResult {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(())
        }
    }

    fn idle_class() -> UserClass {
        UserClass::from_fn("idle", || Idle)
    }

    #[test]
    fn test_stats_listener_registered_first() {
        let env = Environment::builder().build().unwrap();
        assert_eq!(env.events().request.len(), 1);

        env.events()
            .fire_request(&RequestEvent::new("GET", "/").with_response_time(5.0));
        assert_eq!(env.stats().total_requests(), 1);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = RunConfig::new().with_fail_ratio_threshold(3.0);
        let err = Environment::builder().config(config).build().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn test_build_rejects_zero_weight() {
        let err = Environment::builder()
            .user_class(idle_class().with_weight(0))
            .build()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn test_local_runner_requires_user_classes() {
        let env = Environment::builder().build().unwrap();
        let err = env.local_runner().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn test_one_runner_per_environment() {
        let env = Environment::builder().user_class(idle_class()).build().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        env.events().init.add_handler("init", move |event: &LifecycleEvent| {
            sink.lock().push(event.field("runner").cloned());
            Ok(())
        });

        let runner = env.local_runner().unwrap();
        assert_eq!(runner.state(), RunState::Ready);
        assert_eq!(*seen.lock(), vec![Some(serde_json::json!("local"))]);

        let err = env.local_runner().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn test_generated_worker_ids_are_unique() {
        let a = generate_worker_id();
        let b = generate_worker_id();
        assert!(a.starts_with("worker-"));
        assert_ne!(a, b);
    }
}
