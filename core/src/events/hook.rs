//! Ordered multi-listener dispatch

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ListenerError, RunError, RunResult};

/// Something that reacts to events of type `E`
pub trait Listener<E>: Send + Sync {
    /// Handle one event
    fn handle(&self, event: &E) -> Result<(), ListenerError>;

    /// Name used in logs and errors
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Closure adapter registered through [`EventHook::add_handler`]
struct FnListener<F> {
    name: String,
    handler: F,
}

impl<E, F> Listener<E> for FnListener<F>
where
    F: Fn(&E) -> Result<(), ListenerError> + Send + Sync,
{
    fn handle(&self, event: &E) -> Result<(), ListenerError> {
        (self.handler)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle returned on registration, used to remove the listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// What to do when a listener fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Abort the remaining listeners and return the failure
    Propagate,
    /// Log the failure and keep dispatching
    Continue,
}

/// An event channel with an ordered list of listeners
pub struct EventHook<E> {
    name: &'static str,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Listener<E>>)>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl<E> EventHook<E> {
    /// Create an empty hook
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Hook name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a listener object
    pub fn add_listener<L>(&self, listener: L) -> ListenerId
    where
        L: Listener<E> + 'static,
    {
        self.add_shared(Arc::new(listener))
    }

    /// Register a listener that is shared with other owners
    pub fn add_shared(&self, listener: Arc<dyn Listener<E>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Register a closure
    pub fn add_handler<F>(&self, name: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(&E) -> Result<(), ListenerError> + Send + Sync + 'static,
        E: 'static,
    {
        self.add_listener(FnListener {
            name: name.into(),
            handler,
        })
    }

    /// Unregister a listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Listener failures swallowed under [`DispatchPolicy::Continue`]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Invoke every registered listener once, in registration order
    ///
    /// The listener list is snapshotted before dispatch: listeners added
    /// from inside a listener only see later events.
    pub fn fire(&self, event: &E, policy: DispatchPolicy) -> RunResult<()> {
        let snapshot: Vec<Arc<dyn Listener<E>>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            match policy {
                DispatchPolicy::Propagate => {
                    if let Err(e) = listener.handle(event) {
                        tracing::error!(
                            hook = self.name,
                            listener = listener.name(),
                            error = %e,
                            "Listener failed, aborting dispatch"
                        );
                        return Err(RunError::listener(self.name, listener.name(), e));
                    }
                }
                DispatchPolicy::Continue => {
                    let outcome = catch_unwind(AssertUnwindSafe(|| listener.handle(event)));
                    let error = match outcome {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e.to_string(),
                        Err(_) => "listener panicked".to_string(),
                    };
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        hook = self.name,
                        listener = listener.name(),
                        error = %error,
                        "Listener failed, continuing dispatch"
                    );
                }
            }
        }

        Ok(())
    }
}

impl<E> std::fmt::Debug for EventHook<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHook")
            .field("name", &self.name)
            .field("listeners", &self.len())
            .field("failures", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;

    fn recording_hook(n: usize) -> (Arc<EventHook<u32>>, Arc<Mutex<Vec<(usize, u32)>>>) {
        let hook = Arc::new(EventHook::new("test"));
        let calls = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..n {
            let calls = Arc::clone(&calls);
            hook.add_handler(format!("l{idx}"), move |event: &u32| {
                calls.lock().push((idx, *event));
                Ok(())
            });
        }
        (hook, calls)
    }

    #[test]
    fn test_fire_invokes_each_listener_once_in_order() {
        for n in [0, 1, 2, 7] {
            let (hook, calls) = recording_hook(n);
            hook.fire(&42, DispatchPolicy::Propagate).unwrap();

            let expected: Vec<(usize, u32)> = (0..n).map(|idx| (idx, 42)).collect();
            assert_eq!(*calls.lock(), expected);
        }
    }

    #[test]
    fn test_listener_added_during_dispatch_sees_only_later_events() {
        let hook: Arc<EventHook<u32>> = Arc::new(EventHook::new("test"));
        let late_calls = Arc::new(Mutex::new(Vec::new()));

        let inner_hook = Arc::clone(&hook);
        let inner_calls = Arc::clone(&late_calls);
        hook.add_handler("adder", move |event: &u32| {
            if *event == 1 {
                let calls = Arc::clone(&inner_calls);
                inner_hook.add_handler("late", move |event: &u32| {
                    calls.lock().push(*event);
                    Ok(())
                });
            }
            Ok(())
        });

        hook.fire(&1, DispatchPolicy::Continue).unwrap();
        assert!(late_calls.lock().is_empty());
        assert_eq!(hook.len(), 2);

        hook.fire(&2, DispatchPolicy::Continue).unwrap();
        assert_eq!(*late_calls.lock(), vec![2]);
    }

    #[test]
    fn test_remove_listener() {
        let (hook, calls) = recording_hook(3);
        let extra = hook.add_handler("extra", |_: &u32| Ok(()));

        assert!(hook.remove_listener(extra));
        assert!(!hook.remove_listener(extra));
        assert_eq!(hook.len(), 3);

        hook.fire(&5, DispatchPolicy::Propagate).unwrap();
        assert_eq!(calls.lock().len(), 3);
    }

    #[test]
    fn test_propagate_aborts_remaining_listeners() {
        let hook: EventHook<u32> = EventHook::new("init");
        let reached = Arc::new(Mutex::new(false));

        hook.add_handler("broken", |_: &u32| Err(ListenerError::new("bad extension")));
        let flag = Arc::clone(&reached);
        hook.add_handler("after", move |_: &u32| {
            *flag.lock() = true;
            Ok(())
        });

        let err = hook.fire(&0, DispatchPolicy::Propagate).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Listener);
        assert!(err.message.contains("broken"));
        assert!(err.message.contains("bad extension"));
        assert!(!*reached.lock());
    }

    #[test]
    fn test_continue_skips_failures_and_panics() {
        let hook: EventHook<u32> = EventHook::new("request");
        let reached = Arc::new(Mutex::new(0));

        hook.add_handler("broken", |_: &u32| Err(ListenerError::new("oops")));
        hook.add_handler("panicky", |_: &u32| panic!("listener bug"));
        let count = Arc::clone(&reached);
        hook.add_handler("after", move |_: &u32| {
            *count.lock() += 1;
            Ok(())
        });

        hook.fire(&0, DispatchPolicy::Continue).unwrap();
        hook.fire(&1, DispatchPolicy::Continue).unwrap();

        assert_eq!(*reached.lock(), 2);
        assert_eq!(hook.failure_count(), 4);
    }

    struct Named;

    impl Listener<u32> for Named {
        fn handle(&self, _event: &u32) -> Result<(), ListenerError> {
            Err(ListenerError::new("nope"))
        }

        fn name(&self) -> &str {
            "named"
        }
    }

    #[test]
    fn test_listener_object_name_in_error() {
        let hook: EventHook<u32> = EventHook::new("test_start");
        hook.add_listener(Named);

        let err = hook.fire(&0, DispatchPolicy::Propagate).unwrap_err();
        assert!(err.message.contains("named"));
        assert!(err.message.contains("test_start"));
    }
}
