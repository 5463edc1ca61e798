//! Event payloads passed to listeners
//!
//! Both event structs are `#[non_exhaustive]` and carry an open `extra`
//! map, so fields can be added later without breaking listeners that only
//! read what they know about.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-request metadata, carried through to listeners
pub type Context = Map<String, Value>;

/// Merge an explicit per-request context over per-user defaults
///
/// Keys present in `explicit` win.
pub fn merge_context(defaults: &Context, explicit: &Context) -> Context {
    let mut merged = defaults.clone();
    for (key, value) in explicit {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// One completed request attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RequestEvent {
    /// Request type, e.g. "GET" or "grpc"
    pub request_type: String,

    /// Request name used for grouping stats
    pub name: String,

    /// Response time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,

    /// Response size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length: Option<u64>,

    /// Protocol specific response payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Merged request context
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Context,

    /// Error description when the request failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,

    /// Additional fields
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl RequestEvent {
    /// Create an event for a request of `request_type` named `name`
    pub fn new(request_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            name: name.into(),
            response_time: None,
            response_length: None,
            response: None,
            context: Context::new(),
            exception: None,
            extra: Map::new(),
        }
    }

    /// Set the response time in milliseconds
    pub fn with_response_time(mut self, ms: f64) -> Self {
        self.response_time = Some(ms);
        self
    }

    /// Set the response length in bytes
    pub fn with_response_length(mut self, bytes: u64) -> Self {
        self.response_length = Some(bytes);
        self
    }

    /// Attach the protocol specific response
    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    /// Set the explicit request context
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Mark the request as failed
    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    /// Add a field outside the fixed set
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether the request failed
    pub fn is_failure(&self) -> bool {
        self.exception.is_some()
    }
}

/// Run lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    /// Runner created
    Init,
    /// A new run is starting
    TestStart,
    /// A run ended, normally or with an error
    TestStop,
    /// All requested users are running
    SpawningComplete,
    /// The process-level run is terminating
    Quitting,
}

impl LifecycleKind {
    /// All kinds, in lifecycle order
    pub const ALL: [LifecycleKind; 5] = [
        LifecycleKind::Init,
        LifecycleKind::TestStart,
        LifecycleKind::SpawningComplete,
        LifecycleKind::TestStop,
        LifecycleKind::Quitting,
    ];

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::Init => "init",
            LifecycleKind::TestStart => "test_start",
            LifecycleKind::TestStop => "test_stop",
            LifecycleKind::SpawningComplete => "spawning_complete",
            LifecycleKind::Quitting => "quitting",
        }
    }
}

/// Lifecycle event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct LifecycleEvent {
    /// Event kind
    pub kind: LifecycleKind,

    /// Named fields
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,

    /// Run-level error, set when the transition was caused by a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LifecycleEvent {
    /// Create an event of `kind` without fields
    pub fn new(kind: LifecycleKind) -> Self {
        Self {
            kind,
            fields: Map::new(),
            error: None,
        }
    }

    /// Add a named field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Replace all fields
    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    /// Attach a run-level error
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Look up a field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_merge_context_explicit_wins() {
        let defaults = ctx(json!({"a": 2, "b": 3}));
        let explicit = ctx(json!({"a": 1}));

        let merged = merge_context(&defaults, &explicit);
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 3}));
    }

    #[test]
    fn test_merge_context_empty_sides() {
        let defaults = ctx(json!({"user": "u1"}));
        assert_eq!(merge_context(&defaults, &Context::new()), defaults);
        assert_eq!(merge_context(&Context::new(), &defaults), defaults);
    }

    #[test]
    fn test_request_event_builder() {
        let event = RequestEvent::new("GET", "/items")
            .with_response_time(12.5)
            .with_response_length(512)
            .with_exception("connection reset")
            .with_extra("retries", json!(2));

        assert_eq!(event.request_type, "GET");
        assert_eq!(event.response_time, Some(12.5));
        assert_eq!(event.response_length, Some(512));
        assert!(event.is_failure());
        assert_eq!(event.extra["retries"], json!(2));
    }

    #[test]
    fn test_request_event_unknown_fields_land_in_extra() {
        let event: RequestEvent = serde_json::from_value(json!({
            "request_type": "GET",
            "name": "/",
            "response_time": 3.0,
            "trace_id": "abc"
        }))
        .unwrap();

        assert_eq!(event.response_time, Some(3.0));
        assert_eq!(event.extra["trace_id"], json!("abc"));
        assert!(!event.is_failure());
    }

    #[test]
    fn test_lifecycle_event_fields() {
        let event = LifecycleEvent::new(LifecycleKind::SpawningComplete)
            .with_field("user_count", 10)
            .with_error("boom");

        assert_eq!(event.field("user_count"), Some(&json!(10)));
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert_eq!(event.kind.as_str(), "spawning_complete");
    }
}
