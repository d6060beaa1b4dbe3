//! The service facade: registration, producing, and worker lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use sqlx::postgres::PgPool;
use sqlx::Postgres;

use crate::debounce::Debounced;
use crate::definitions::{EventHandler, HandlerFn, TaskDefinition, TaskInvocation};
use crate::error::{BusError, BusResult};
use crate::factory::TaskFactory;
use crate::migrations;
use crate::sql::{is_valid_schema, Plans};
use crate::types::{
    BusState, Event, EventSpec, MaintenanceConfig, Task, TaskOverrides, TaskSpec, Trigger,
    WorkerConfig,
};
use crate::workers::fanout::FanoutWorker;
use crate::workers::maintenance::MaintenanceWorker;
use crate::workers::task::TaskWorker;

/// Debounce windows for worker wake-ups: bursts of produce calls collapse
/// into one wake, bounded by the max window.
const WAKE_IDLE: Duration = Duration::from_millis(75);
const WAKE_MAX: Duration = Duration::from_millis(300);

const DEFAULT_SCHEMA: &str = "tbus";

/// A rendered statement plus its single JSON argument, for embedding a
/// produce call into a transaction managed elsewhere.
#[derive(Debug, Clone)]
pub struct SqlCommand {
    pub sql: String,
    /// JSON array, bound as `$1`.
    pub argument: String,
}

fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

enum PoolSource {
    None,
    Pool(PgPool),
    Url(String),
}

/// Builder for a [`Bus`].
pub struct BusBuilder {
    service_name: String,
    schema: String,
    worker: WorkerConfig,
    maintenance: MaintenanceConfig,
    task_defaults: TaskOverrides,
    source: PoolSource,
}

impl BusBuilder {
    fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            worker: WorkerConfig::default(),
            maintenance: MaintenanceConfig::default(),
            task_defaults: TaskOverrides::default(),
            source: PoolSource::None,
        }
    }

    /// Postgres schema holding the bus tables (default: `tbus`).
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker = config;
        self
    }

    pub fn maintenance_config(mut self, config: MaintenanceConfig) -> Self {
        self.maintenance = config;
        self
    }

    /// Service-level task defaults, applied below per-task overrides.
    pub fn task_config(mut self, config: TaskOverrides) -> Self {
        self.task_defaults = config;
        self
    }

    /// Use an existing pool. The bus will not close it on [`Bus::stop`].
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.source = PoolSource::Pool(pool);
        self
    }

    /// Connect a dedicated pool from a URL, closed again on [`Bus::stop`].
    pub fn connect(mut self, url: impl Into<String>) -> Self {
        self.source = PoolSource::Url(url.into());
        self
    }

    pub async fn build(self) -> BusResult<Bus> {
        if !is_valid_service_name(&self.service_name) {
            return Err(BusError::InvalidConfiguration {
                reason: format!("invalid service name '{}'", self.service_name),
            });
        }
        if !is_valid_schema(&self.schema) {
            return Err(BusError::InvalidConfiguration {
                reason: format!("invalid schema name '{}'", self.schema),
            });
        }
        if !(0.0..=1.0).contains(&self.worker.refill_pct) {
            return Err(BusError::InvalidConfiguration {
                reason: "refill_pct must be within 0..=1".to_string(),
            });
        }

        let (pool, owns_pool) = match self.source {
            PoolSource::Pool(pool) => (pool, false),
            PoolSource::Url(url) => (PgPool::connect(&url).await?, true),
            PoolSource::None => {
                return Err(BusError::InvalidConfiguration {
                    reason: "either a pool or a connection URL is required".to_string(),
                })
            }
        };

        Ok(Bus {
            inner: Arc::new(BusInner {
                pool,
                owns_pool,
                plans: Plans::new(&self.schema),
                schema: self.schema,
                factory: TaskFactory::new(self.service_name.clone(), self.task_defaults),
                service_name: self.service_name,
                worker_config: self.worker,
                maintenance_config: self.maintenance,
                registry: RwLock::new(Registry::default()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                runtime: Mutex::new(None),
            }),
        })
    }
}

#[derive(Default)]
struct Registry {
    /// Every executable task of this service, keyed by task name. Fanned-out
    /// tasks execute the handler of the event registration that produced
    /// them.
    handlers: HashMap<String, HandlerFn>,
    tasks: Vec<TaskSpec>,
    event_handlers: Vec<EventHandler>,
}

impl Registry {
    fn assert_unregistered(&self, task_name: &str) -> BusResult<()> {
        if self.handlers.contains_key(task_name) {
            return Err(BusError::AlreadyRegistered {
                task_name: task_name.to_string(),
            });
        }
        Ok(())
    }
}

struct Runtime {
    task_worker: Arc<TaskWorker>,
    fanout_worker: Arc<FanoutWorker>,
    maintenance_worker: MaintenanceWorker,
    task_wake: Debounced<()>,
    fanout_wake: Debounced<()>,
}

struct BusInner {
    pool: PgPool,
    owns_pool: bool,
    service_name: String,
    schema: String,
    plans: Plans,
    factory: TaskFactory,
    worker_config: WorkerConfig,
    maintenance_config: MaintenanceConfig,
    registry: RwLock<Registry>,
    started: AtomicBool,
    stopped: AtomicBool,
    runtime: Mutex<Option<Runtime>>,
}

/// A persistent task-and-event bus bound to one service (and therefore one
/// queue).
///
/// ```no_run
/// use serde_json::json;
/// use tbus::{Bus, TaskDefinition};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), tbus::BusError> {
/// let bus = Bus::builder("account-svc").pool(pool).build().await?;
///
/// let send_mail = TaskDefinition::new(
///     "send_welcome_mail",
///     json!({"type": "object"}),
///     |invocation| async move { Ok(json!(null)) },
/// )?;
/// bus.register_task(send_mail.clone())?;
///
/// bus.start().await?;
/// bus.send(send_mail.from(json!({"user_id": "u1"}))?).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("service_name", &self.inner.service_name)
            .field("schema", &self.inner.schema)
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub fn builder(service_name: impl Into<String>) -> BusBuilder {
        BusBuilder::new(service_name)
    }

    /// The queue this service consumes from (its service name).
    pub fn queue(&self) -> &str {
        &self.inner.service_name
    }

    pub fn schema(&self) -> &str {
        &self.inner.schema
    }

    /// Register a directly sendable task. The definition's explicit queue,
    /// if any, must match this service's queue.
    pub fn register_task(&self, definition: TaskDefinition) -> BusResult<()> {
        if let Some(queue) = definition.queue_name() {
            if queue != self.inner.service_name {
                return Err(BusError::WrongQueue {
                    task_name: definition.task_name().to_string(),
                    expected: self.inner.service_name.clone(),
                    got: queue.to_string(),
                });
            }
        }

        let mut registry = self.inner.registry.write().expect("registry lock poisoned");
        registry.assert_unregistered(definition.task_name())?;
        registry.tasks.push(TaskSpec {
            task_name: definition.task_name().to_string(),
            on_event: None,
            schema: definition.schema().clone(),
            config: definition.overrides().clone(),
        });
        registry
            .handlers
            .insert(definition.task_name().to_string(), definition.handler());
        Ok(())
    }

    /// Register an event handler: every published event with a matching name
    /// fans out into one task on this service's queue.
    pub fn register_handler(&self, handler: EventHandler) -> BusResult<()> {
        let mut registry = self.inner.registry.write().expect("registry lock poisoned");
        registry.assert_unregistered(handler.task_name())?;
        registry.tasks.push(TaskSpec {
            task_name: handler.task_name().to_string(),
            on_event: Some(handler.event_name().to_string()),
            schema: handler.schema().clone(),
            config: handler.handler_config().as_static(),
        });
        registry
            .handlers
            .insert(handler.task_name().to_string(), handler.handler());
        registry.event_handlers.push(handler);
        Ok(())
    }

    /// Pure snapshot of everything registered on this instance.
    pub fn get_state(&self) -> BusState {
        let registry = self.inner.registry.read().expect("registry lock poisoned");
        let mut events: Vec<EventSpec> = Vec::new();
        for handler in &registry.event_handlers {
            if events.iter().all(|e| e.event_name != handler.event_name()) {
                events.push(EventSpec {
                    event_name: handler.event_name().to_string(),
                    schema: handler.schema().clone(),
                });
            }
        }
        BusState {
            queue: self.inner.service_name.clone(),
            events,
            tasks: registry.tasks.clone(),
        }
    }

    /// The insert statement and argument for a batch of tasks, for embedding
    /// into a caller-managed transaction.
    pub fn send_command(&self, tasks: Vec<Task>) -> BusResult<SqlCommand> {
        let (argument, _) = self.task_payload(tasks)?;
        Ok(SqlCommand {
            sql: self.inner.plans.create_tasks(),
            argument,
        })
    }

    /// The append statement and argument for a batch of events, for embedding
    /// into a caller-managed transaction.
    pub fn publish_command(&self, events: Vec<Event>) -> BusResult<SqlCommand> {
        Ok(SqlCommand {
            sql: self.inner.plans.create_events(),
            argument: serde_json::to_string(&events)?,
        })
    }

    /// Enqueue one task.
    pub async fn send(&self, task: Task) -> BusResult<()> {
        self.send_many(vec![task]).await
    }

    /// Enqueue a batch of tasks in one round trip.
    #[tracing::instrument(skip_all, fields(service = %self.inner.service_name, tasks = tasks.len()))]
    pub async fn send_many(&self, tasks: Vec<Task>) -> BusResult<()> {
        let (argument, handled_locally) = self.task_payload(tasks)?;
        sqlx::query(&self.inner.plans.create_tasks())
            .bind(argument)
            .execute(&self.inner.pool)
            .await?;

        if handled_locally {
            self.wake_task_worker();
        }
        Ok(())
    }

    /// Enqueue tasks on a caller-provided executor, typically a transaction,
    /// so the enqueue commits or rolls back with the caller's own writes.
    pub async fn send_with<'e, E>(&self, tasks: Vec<Task>, executor: E) -> BusResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let (argument, _) = self.task_payload(tasks)?;
        sqlx::query(&self.inner.plans.create_tasks())
            .bind(argument)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Append one event to the log.
    pub async fn publish(&self, event: Event) -> BusResult<()> {
        self.publish_many(vec![event]).await
    }

    /// Append a batch of events in one round trip.
    #[tracing::instrument(skip_all, fields(service = %self.inner.service_name, events = events.len()))]
    pub async fn publish_many(&self, events: Vec<Event>) -> BusResult<()> {
        let handled_locally = {
            let registry = self.inner.registry.read().expect("registry lock poisoned");
            events.iter().any(|event| {
                registry
                    .event_handlers
                    .iter()
                    .any(|handler| handler.event_name() == event.event_name)
            })
        };

        let command = self.publish_command(events)?;
        sqlx::query(&command.sql)
            .bind(command.argument)
            .execute(&self.inner.pool)
            .await?;

        if handled_locally {
            self.wake_fanout_worker();
        }
        Ok(())
    }

    /// Append events on a caller-provided executor, typically a transaction.
    pub async fn publish_with<'e, E>(&self, events: Vec<Event>, executor: E) -> BusResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let command = self.publish_command(events)?;
        sqlx::query(&command.sql)
            .bind(command.argument)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Migrate the schema, bootstrap this service's cursor at the current
    /// event tip, and start the workers. Idempotent; a stopped bus cannot be
    /// restarted.
    pub async fn start(&self) -> BusResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(BusError::InvalidConfiguration {
                reason: "a stopped bus cannot be restarted".to_string(),
            });
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // a failed startup must leave the bus startable again, so the
        // error does not turn later attempts into silent no-ops
        if let Err(err) = self.run_startup().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    async fn run_startup(&self) -> BusResult<()> {
        let inner = &self.inner;
        migrations::migrate(&inner.pool, &inner.schema).await?;

        // new services start at the tip: events published before the first
        // start are not fanned out retroactively
        let tip: Option<i64> = sqlx::query_scalar(&inner.plans.get_last_event_position())
            .fetch_optional(&inner.pool)
            .await?;
        sqlx::query(&inner.plans.ensure_cursor())
            .bind(&inner.service_name)
            .bind(tip.unwrap_or(0))
            .execute(&inner.pool)
            .await?;

        let dispatch = self.dispatch_handler();
        let task_worker = Arc::new(TaskWorker::new(
            inner.pool.clone(),
            inner.plans.clone(),
            inner.service_name.clone(),
            &inner.worker_config,
            dispatch,
        ));

        let wake_task = task_worker.clone();
        let task_wake = Debounced::new(move |_| wake_task.notify(), WAKE_IDLE, WAKE_MAX);

        // fanned-out batches wake the task worker through the same debounced
        // window as local produce calls
        let registry_inner = self.inner.clone();
        let new_tasks_wake = task_wake.handle();
        let fanout_worker = Arc::new(FanoutWorker::new(
            inner.pool.clone(),
            inner.plans.clone(),
            inner.service_name.clone(),
            inner.factory.clone(),
            Arc::new(move || {
                registry_inner
                    .registry
                    .read()
                    .expect("registry lock poisoned")
                    .event_handlers
                    .clone()
            }),
            Arc::new(move || new_tasks_wake.call(())),
            inner.worker_config.interval_in_ms,
        ));

        let maintenance_worker =
            MaintenanceWorker::new(inner.pool.clone(), inner.plans.clone(), &inner.maintenance_config);

        task_worker.start();
        fanout_worker.start();
        maintenance_worker.start();

        let wake_fanout = fanout_worker.clone();
        let runtime = Runtime {
            task_worker,
            fanout_worker,
            maintenance_worker,
            task_wake,
            fanout_wake: Debounced::new(move |_| wake_fanout.notify(), WAKE_IDLE, WAKE_MAX),
        };
        *inner.runtime.lock().expect("runtime lock poisoned") = Some(runtime);

        tracing::info!(
            service = %inner.service_name,
            schema = %inner.schema,
            "bus started"
        );
        Ok(())
    }

    /// Stop the workers, drain in-flight tasks, flush pending resolutions,
    /// and close the pool when this bus owns it. Idempotent.
    pub async fn stop(&self) -> BusResult<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let runtime = self
            .inner
            .runtime
            .lock()
            .expect("runtime lock poisoned")
            .take();

        if let Some(runtime) = runtime {
            // producers first, then the task worker so it can drain
            runtime.fanout_worker.stop().await;
            runtime.maintenance_worker.stop().await;
            runtime.task_worker.stop().await;
        }

        if self.inner.owns_pool {
            self.inner.pool.close().await;
        }

        tracing::info!(service = %self.inner.service_name, "bus stopped");
        Ok(())
    }

    /// Serialize tasks into the bulk-insert argument, reporting whether any
    /// of them is executable by this instance: on its own queue with a
    /// registered handler. Only those warrant waking the task worker.
    fn task_payload(&self, tasks: Vec<Task>) -> BusResult<(String, bool)> {
        let inserts: Vec<_> = tasks
            .iter()
            .map(|task| self.inner.factory.to_insert(task, Trigger::Direct))
            .collect();
        let handled_locally = {
            let registry = self.inner.registry.read().expect("registry lock poisoned");
            inserts.iter().any(|insert| {
                insert.queue == self.inner.service_name
                    && registry.handlers.contains_key(&insert.data.tn)
            })
        };
        Ok((serde_json::to_string(&inserts)?, handled_locally))
    }

    /// The type-erased dispatch entry the task worker runs for every claimed
    /// task: looks up the registered handler by task name.
    fn dispatch_handler(&self) -> HandlerFn {
        let inner = self.inner.clone();
        Arc::new(move |invocation: TaskInvocation| {
            let handler = inner
                .registry
                .read()
                .expect("registry lock poisoned")
                .handlers
                .get(&invocation.name)
                .cloned();
            match handler {
                Some(handler) => handler(invocation),
                None => {
                    let name = invocation.name;
                    tracing::error!(task = %name, "no handler registered");
                    Box::pin(async move {
                        Err(anyhow::anyhow!("no handler registered for task {name}"))
                    })
                }
            }
        })
    }

    fn wake_task_worker(&self) {
        let runtime = self.inner.runtime.lock().expect("runtime lock poisoned");
        if let Some(runtime) = runtime.as_ref() {
            runtime.task_wake.call(());
        }
    }

    fn wake_fanout_worker(&self) {
        let runtime = self.inner.runtime.lock().expect("runtime lock poisoned");
        if let Some(runtime) = runtime.as_ref() {
            runtime.fanout_wake.call(());
        }
    }
}
