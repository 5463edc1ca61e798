//! Event hooks
//!
//! [`Events`] bundles one [`EventHook`] for request events and one per
//! [`LifecycleKind`]. Request events are dispatched with
//! [`DispatchPolicy::Continue`] so a broken listener never slows down load
//! generation; lifecycle events use [`DispatchPolicy::Propagate`] so a
//! misconfigured extension fails the run loudly.
//!
//! # Example
//!
//! ```
//! use loadhive_core::events::{Events, RequestEvent};
//!
//! let events = Events::new();
//! events.request.add_handler("printer", |event: &RequestEvent| {
//!     println!("{} {}", event.request_type, event.name);
//!     Ok(())
//! });
//! events.fire_request(&RequestEvent::new("GET", "/").with_response_time(3.2));
//! ```

mod event;
mod hook;

pub use event::{merge_context, Context, LifecycleEvent, LifecycleKind, RequestEvent};
pub use hook::{DispatchPolicy, EventHook, Listener, ListenerId};

use serde_json::{Map, Value};

use crate::error::RunResult;

/// All event channels of one environment
#[derive(Debug)]
pub struct Events {
    /// Completed request attempts
    pub request: EventHook<RequestEvent>,
    /// Runner created
    pub init: EventHook<LifecycleEvent>,
    /// Run starting
    pub test_start: EventHook<LifecycleEvent>,
    /// Run ended
    pub test_stop: EventHook<LifecycleEvent>,
    /// Target user count reached
    pub spawning_complete: EventHook<LifecycleEvent>,
    /// Process-level run terminating
    pub quitting: EventHook<LifecycleEvent>,
}

impl Events {
    /// Create hooks without listeners
    pub fn new() -> Self {
        Self {
            request: EventHook::new("request"),
            init: EventHook::new("init"),
            test_start: EventHook::new("test_start"),
            test_stop: EventHook::new("test_stop"),
            spawning_complete: EventHook::new("spawning_complete"),
            quitting: EventHook::new("quitting"),
        }
    }

    /// The hook for a lifecycle kind
    pub fn lifecycle(&self, kind: LifecycleKind) -> &EventHook<LifecycleEvent> {
        match kind {
            LifecycleKind::Init => &self.init,
            LifecycleKind::TestStart => &self.test_start,
            LifecycleKind::TestStop => &self.test_stop,
            LifecycleKind::SpawningComplete => &self.spawning_complete,
            LifecycleKind::Quitting => &self.quitting,
        }
    }

    /// Publish a request event; listener failures are logged, never returned
    pub fn fire_request(&self, event: &RequestEvent) {
        // Continue never returns an error
        let _ = self.request.fire(event, DispatchPolicy::Continue);
    }

    /// Publish a lifecycle event built from `kind` and `fields`
    pub fn fire_lifecycle(&self, kind: LifecycleKind, fields: Map<String, Value>) -> RunResult<()> {
        self.fire_lifecycle_event(&LifecycleEvent::new(kind).with_fields(fields))
    }

    /// Publish a prepared lifecycle event
    pub fn fire_lifecycle_event(&self, event: &LifecycleEvent) -> RunResult<()> {
        tracing::debug!(kind = event.kind.as_str(), "Firing lifecycle event");
        self.lifecycle(event.kind)
            .fire(event, DispatchPolicy::Propagate)
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ListenerError};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_fire_request_swallows_listener_failures() {
        let events = Events::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        events
            .request
            .add_handler("broken", |_: &RequestEvent| Err(ListenerError::new("bug")));
        let sink = Arc::clone(&seen);
        events.request.add_handler("sink", move |event: &RequestEvent| {
            sink.lock().push(event.name.clone());
            Ok(())
        });

        events.fire_request(&RequestEvent::new("GET", "/a"));
        events.fire_request(&RequestEvent::new("GET", "/b"));

        assert_eq!(*seen.lock(), vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(events.request.failure_count(), 2);
    }

    #[test]
    fn test_fire_lifecycle_routes_by_kind() {
        let events = Events::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for kind in LifecycleKind::ALL {
            let sink = Arc::clone(&seen);
            events
                .lifecycle(kind)
                .add_handler(kind.as_str(), move |event: &LifecycleEvent| {
                    sink.lock().push(event.kind);
                    Ok(())
                });
        }

        let mut fields = Map::new();
        fields.insert("user_count".into(), 3.into());
        events
            .fire_lifecycle(LifecycleKind::SpawningComplete, fields)
            .unwrap();
        events
            .fire_lifecycle(LifecycleKind::Quitting, Map::new())
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![LifecycleKind::SpawningComplete, LifecycleKind::Quitting]
        );
    }

    #[test]
    fn test_fire_lifecycle_propagates() {
        let events = Events::new();
        events.init.add_handler("bad-plugin", |_: &LifecycleEvent| {
            Err(ListenerError::new("missing setting"))
        });

        let err = events
            .fire_lifecycle(LifecycleKind::Init, Map::new())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Listener);
    }
}
