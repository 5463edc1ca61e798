//! Simulated users

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::{merge_context, Context, Events, RequestEvent};

/// Boxed error returned by user code
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one user iteration
///
/// An `Err` is an unexpected failure in the user's own code. Failed requests
/// are reported through [`UserContext::fire_request`] instead.
pub type IterationResult = Result<(), BoxError>;

/// Behavior of one simulated client
///
/// The runner calls [`User::run`] in a loop, sleeping
/// [`User::wait_time`] between iterations. A stop request is honored between
/// iterations and during the wait, never in the middle of `run`.
#[async_trait]
pub trait User: Send {
    /// Called once before the first iteration
    async fn on_start(&mut self, _ctx: &UserContext) {}

    /// Execute one iteration
    async fn run(&mut self, ctx: &UserContext) -> IterationResult;

    /// Pause between iterations
    fn wait_time(&self) -> Duration {
        Duration::ZERO
    }

    /// Called once after the last iteration
    async fn on_stop(&mut self, _ctx: &UserContext) {}
}

type UserFactory = dyn Fn() -> Result<Box<dyn User>, BoxError> + Send + Sync;

/// A named, weighted user definition
#[derive(Clone)]
pub struct UserClass {
    name: String,
    weight: u32,
    default_context: Context,
    factory: Arc<UserFactory>,
}

impl UserClass {
    /// Create a class from a fallible factory
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn User>, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            weight: 1,
            default_context: Context::new(),
            factory: Arc::new(factory),
        }
    }

    /// Create a class from an infallible constructor
    pub fn from_fn<U, F>(name: impl Into<String>, make: F) -> Self
    where
        U: User + 'static,
        F: Fn() -> U + Send + Sync + 'static,
    {
        Self::new(name, move || Ok(Box::new(make()) as Box<dyn User>))
    }

    /// Relative share of spawned users (default 1)
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Context merged into every request this class reports
    pub fn with_default_context(mut self, context: Context) -> Self {
        self.default_context = context;
        self
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class weight
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Default request context
    pub fn default_context(&self) -> &Context {
        &self.default_context
    }

    /// Instantiate a user
    pub fn instantiate(&self) -> Result<Box<dyn User>, BoxError> {
        (self.factory)()
    }
}

impl std::fmt::Debug for UserClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserClass")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// What a running user can see of its environment
#[derive(Clone)]
pub struct UserContext {
    user_id: u64,
    class_name: String,
    events: Arc<Events>,
    default_context: Context,
}

impl UserContext {
    /// Create a context for user `user_id` of `class`
    pub fn new(user_id: u64, class: &UserClass, events: Arc<Events>) -> Self {
        Self {
            user_id,
            class_name: class.name.clone(),
            events,
            default_context: class.default_context.clone(),
        }
    }

    /// Process-unique user id
    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    /// Name of the user's class
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Publish a request event, merging the event's context over the
    /// user's default context
    pub fn fire_request(&self, mut event: RequestEvent) {
        event.context = merge_context(&self.default_context, &event.context);
        self.events.fire_request(&event);
    }

    /// Time `request` and publish its outcome
    ///
    /// An `Err` is recorded as a failed request and handed back to the
    /// caller unchanged.
    pub async fn track<T, E, F>(
        &self,
        request_type: &str,
        name: &str,
        request: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let outcome = request.await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut event = RequestEvent::new(request_type, name).with_response_time(elapsed_ms);
        if let Err(e) = &outcome {
            event = event.with_exception(e.to_string());
        }
        self.fire_request(event);
        outcome
    }
}

impl std::fmt::Debug for UserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserContext")
            .field("user_id", &self.user_id)
            .field("class_name", &self.class_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct Idle;

    #[async_trait]
    impl User for Idle {
        async fn run(&mut self, _ctx: &UserContext) -> IterationResult {
            Ok(())
        }
    }

    fn capture(events: &Events) -> Arc<Mutex<Vec<RequestEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.request.add_handler("capture", move |event: &RequestEvent| {
            sink.lock().push(event.clone());
            Ok(())
        });
        seen
    }

    fn object(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_fire_request_merges_context() {
        let events = Arc::new(Events::new());
        let seen = capture(&events);
        let class = UserClass::from_fn("idle", || Idle)
            .with_default_context(object(json!({"a": 2, "b": 3})));
        let ctx = UserContext::new(7, &class, Arc::clone(&events));

        ctx.fire_request(
            RequestEvent::new("GET", "/")
                .with_response_time(1.0)
                .with_context(object(json!({"a": 1}))),
        );

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(Value::Object(seen[0].context.clone()), json!({"a": 1, "b": 3}));
    }

    #[tokio::test]
    async fn test_track_records_success_and_failure() {
        let events = Arc::new(Events::new());
        let seen = capture(&events);
        let class = UserClass::from_fn("idle", || Idle);
        let ctx = UserContext::new(1, &class, events);

        let ok: Result<u32, String> = ctx.track("GET", "/ok", async { Ok(5) }).await;
        assert_eq!(ok, Ok(5));
        let err: Result<u32, String> = ctx
            .track("GET", "/err", async { Err("refused".to_string()) })
            .await;
        assert!(err.is_err());

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].is_failure());
        assert!(seen[0].response_time.is_some());
        assert_eq!(seen[1].exception.as_deref(), Some("refused"));
    }

    #[test]
    fn test_user_class_factory_errors() {
        let class = UserClass::new("broken", || Err("no credentials".into())).with_weight(3);
        assert_eq!(class.weight(), 3);
        let err = class.instantiate().err().unwrap();
        assert_eq!(err.to_string(), "no credentials");
    }
}
