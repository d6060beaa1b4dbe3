//! Event and task definitions.
//!
//! A definition pairs a name with a JSON schema and (for tasks) an async
//! handler. The schema is compiled once; `from(input)` gates producer-side
//! data synchronously, before any SQL is issued.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use jsonschema::Validator;
use serde_json::Value as JsonValue;

use crate::error::{BusError, BusResult};
use crate::types::{Event, Task, TaskOverrides, Trigger};

/// The input handed to a task handler on dispatch.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    /// Task name.
    pub name: String,
    /// The payload the producer validated against the task's schema.
    pub input: JsonValue,
    /// Provenance: direct send or the originating event.
    pub trigger: Trigger,
}

/// Boxed future returned by task handlers.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<JsonValue>>;

/// Type-erased async task handler.
pub(crate) type HandlerFn = Arc<dyn Fn(TaskInvocation) -> HandlerFuture + Send + Sync>;

fn erase_handler<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    Arc::new(move |invocation| Box::pin(handler(invocation)))
}

fn compile_validator(name: &str, schema: &JsonValue) -> BusResult<Arc<Validator>> {
    jsonschema::validator_for(schema)
        .map(Arc::new)
        .map_err(|err| BusError::InvalidSchema {
            name: name.to_string(),
            reason: err.to_string(),
        })
}

fn validate(validator: &Validator, name: &str, input: &JsonValue) -> BusResult<()> {
    let errors: Vec<String> = validator
        .iter_errors(input)
        .map(|err| err.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BusError::Validation {
            name: name.to_string(),
            reason: errors.join(" \n"),
        })
    }
}

/// Definition of an integration event.
#[derive(Clone)]
pub struct EventDefinition {
    event_name: String,
    schema: JsonValue,
    validator: Arc<Validator>,
}

impl EventDefinition {
    pub fn new(event_name: impl Into<String>, schema: JsonValue) -> BusResult<Self> {
        let event_name = event_name.into();
        let validator = compile_validator(&event_name, &schema)?;
        Ok(Self {
            event_name,
            schema,
            validator,
        })
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn schema(&self) -> &JsonValue {
        &self.schema
    }

    /// Validate `data` and build a publishable [`Event`].
    pub fn from(&self, data: JsonValue) -> BusResult<Event> {
        validate(&self.validator, &format!("event {}", self.event_name), &data)?;
        Ok(Event {
            event_name: self.event_name.clone(),
            data,
        })
    }
}

impl std::fmt::Debug for EventDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDefinition")
            .field("event_name", &self.event_name)
            .field("schema", &self.schema)
            .finish()
    }
}

/// Definition of a directly sendable task: name, schema, handler, and
/// optional per-task configuration.
///
/// ```no_run
/// use serde_json::json;
/// use tbus::TaskDefinition;
///
/// let def = TaskDefinition::new(
///     "send_welcome_mail",
///     json!({"type": "object", "properties": {"user_id": {"type": "string"}}}),
///     |invocation| async move {
///         // ... deliver the mail ...
///         Ok(json!({"delivered": true}))
///     },
/// )?;
/// # Ok::<(), tbus::BusError>(())
/// ```
#[derive(Clone)]
pub struct TaskDefinition {
    task_name: String,
    queue: Option<String>,
    schema: JsonValue,
    validator: Arc<Validator>,
    config: TaskOverrides,
    handler: HandlerFn,
}

impl TaskDefinition {
    pub fn new<F, Fut>(task_name: impl Into<String>, schema: JsonValue, handler: F) -> BusResult<Self>
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        let task_name = task_name.into();
        let validator = compile_validator(&task_name, &schema)?;
        Ok(Self {
            task_name,
            queue: None,
            schema,
            validator,
            config: TaskOverrides::default(),
            handler: erase_handler(handler),
        })
    }

    /// Target an explicit queue. A definition with an explicit queue can only
    /// be registered on the bus owning that queue; sending it from other
    /// services still works.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Per-task configuration overrides (highest precedence).
    pub fn config(mut self, config: TaskOverrides) -> Self {
        self.config = config;
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn schema(&self) -> &JsonValue {
        &self.schema
    }

    pub(crate) fn overrides(&self) -> &TaskOverrides {
        &self.config
    }

    pub(crate) fn handler(&self) -> HandlerFn {
        self.handler.clone()
    }

    /// Validate `input` and build a sendable [`Task`].
    pub fn from(&self, input: JsonValue) -> BusResult<Task> {
        validate(&self.validator, &format!("task {}", self.task_name), &input)?;
        Ok(Task {
            task_name: self.task_name.clone(),
            queue: self.queue.clone(),
            data: input,
            config: self.config.clone(),
        })
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_name", &self.task_name)
            .field("queue", &self.queue)
            .field("schema", &self.schema)
            .field("config", &self.config)
            .finish()
    }
}

/// Configuration for a fanned-out task: either a static override set or a
/// pure function of the event payload, invoked once per event inside the
/// fanout transaction. The dynamic branch must not block.
#[derive(Clone)]
pub enum HandlerConfig {
    Static(TaskOverrides),
    Dynamic(Arc<dyn Fn(&JsonValue) -> TaskOverrides + Send + Sync>),
}

impl HandlerConfig {
    pub(crate) fn resolve(&self, payload: &JsonValue) -> TaskOverrides {
        match self {
            Self::Static(overrides) => overrides.clone(),
            Self::Dynamic(f) => f(payload),
        }
    }

    /// The reportable config: dynamic configs have no static shape.
    pub(crate) fn as_static(&self) -> TaskOverrides {
        match self {
            Self::Static(overrides) => overrides.clone(),
            Self::Dynamic(_) => TaskOverrides::default(),
        }
    }
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(overrides) => f.debug_tuple("Static").field(overrides).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Registration of a task created whenever a given event is published.
///
/// During fanout, every event matching `event_name` produces one task named
/// `task_name` in the registering service's queue.
#[derive(Clone)]
pub struct EventHandler {
    task_name: String,
    event_name: String,
    schema: JsonValue,
    config: HandlerConfig,
    handler: HandlerFn,
}

impl EventHandler {
    pub fn new<F, Fut>(task_name: impl Into<String>, event: &EventDefinition, handler: F) -> Self
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        Self {
            task_name: task_name.into(),
            event_name: event.event_name.clone(),
            schema: event.schema.clone(),
            config: HandlerConfig::Static(TaskOverrides::default()),
            handler: erase_handler(handler),
        }
    }

    /// Static configuration for the produced tasks.
    pub fn config(mut self, config: TaskOverrides) -> Self {
        self.config = HandlerConfig::Static(config);
        self
    }

    /// Derive the produced task's configuration from the event payload.
    /// Runs inside the fanout transaction; must be pure and fast.
    pub fn config_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&JsonValue) -> TaskOverrides + Send + Sync + 'static,
    {
        self.config = HandlerConfig::Dynamic(Arc::new(f));
        self
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn schema(&self) -> &JsonValue {
        &self.schema
    }

    pub(crate) fn handler_config(&self) -> &HandlerConfig {
        &self.config
    }

    pub(crate) fn handler(&self) -> HandlerFn {
        self.handler.clone()
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("task_name", &self.task_name)
            .field("event_name", &self.event_name)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn works_schema() -> JsonValue {
        json!({
            "type": "object",
            "properties": {"works": {"type": "string"}},
            "required": ["works"],
        })
    }

    #[test]
    fn event_from_validates_input() {
        let def = EventDefinition::new("user_created", works_schema()).unwrap();

        let event = def.from(json!({"works": "yes"})).unwrap();
        assert_eq!(event.event_name, "user_created");
        assert_eq!(event.data, json!({"works": "yes"}));

        let err = def.from(json!({"works": 42})).unwrap_err();
        assert!(matches!(err, BusError::Validation { .. }));
    }

    #[test]
    fn task_from_validates_and_carries_config() {
        let def = TaskDefinition::new("t1", works_schema(), |_| async { Ok(json!(null)) })
            .unwrap()
            .config(TaskOverrides {
                retry_limit: Some(1),
                ..Default::default()
            });

        let task = def.from(json!({"works": "abcd"})).unwrap();
        assert_eq!(task.task_name, "t1");
        assert_eq!(task.config.retry_limit, Some(1));
        assert!(def.from(json!({})).is_err());
    }

    #[test]
    fn rejects_malformed_schema() {
        let err = EventDefinition::new("bad", json!({"type": "no-such-type"})).unwrap_err();
        assert!(matches!(err, BusError::InvalidSchema { .. }));
    }

    #[test]
    fn dynamic_config_sees_the_payload() {
        let event = EventDefinition::new("e", json!({"type": "object"})).unwrap();
        let handler = EventHandler::new("t", &event, |_| async { Ok(json!(null)) }).config_fn(
            |payload| TaskOverrides {
                singleton_key: payload["key"].as_str().map(String::from),
                ..Default::default()
            },
        );

        let resolved = handler.handler_config().resolve(&json!({"key": "k1"}));
        assert_eq!(resolved.singleton_key.as_deref(), Some("k1"));
        // dynamic configs report an empty static shape
        assert_eq!(handler.handler_config().as_static(), TaskOverrides::default());
    }
}
