//! The fanout worker: advances one service's cursor by translating newly
//! visible events into tasks for that service's queue.
//!
//! The whole step is one transaction. The cursor row is taken with
//! `FOR UPDATE SKIP LOCKED`, so at most one process fans out a given service
//! at a time; losers observe no events and try again next tick.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::definitions::EventHandler;
use crate::error::BusResult;
use crate::factory::TaskFactory;
use crate::sql::Plans;
use crate::types::{EventRow, EventTrigger, InsertTask, Task, Trigger};
use crate::workers::base::{StepHint, Worker};

/// Events translated per transaction. A full fetch hints that more are
/// waiting.
const FETCH_SIZE: usize = 100;

pub(crate) type HandlerSnapshotFn = Arc<dyn Fn() -> Vec<EventHandler> + Send + Sync>;
pub(crate) type NewTasksFn = Arc<dyn Fn() + Send + Sync>;

struct FanoutCtx {
    pool: PgPool,
    plans: Plans,
    service_name: String,
    factory: TaskFactory,
    get_handlers: HandlerSnapshotFn,
    on_new_tasks: NewTasksFn,
}

struct FanoutOutcome {
    produced_tasks: bool,
    has_more: bool,
}

pub(crate) struct FanoutWorker {
    worker: Worker,
}

impl FanoutWorker {
    pub fn new(
        pool: PgPool,
        plans: Plans,
        service_name: impl Into<String>,
        factory: TaskFactory,
        get_handlers: HandlerSnapshotFn,
        on_new_tasks: NewTasksFn,
        interval_in_ms: u64,
    ) -> Self {
        let ctx = Arc::new(FanoutCtx {
            pool,
            plans,
            service_name: service_name.into(),
            factory,
            get_handlers,
            on_new_tasks,
        });

        let worker = Worker::new(Duration::from_millis(interval_in_ms), move || {
            let ctx = ctx.clone();
            async move { step(ctx).await }
        });

        Self { worker }
    }

    pub fn start(&self) {
        self.worker.start();
    }

    pub fn notify(&self) {
        self.worker.notify();
    }

    pub async fn stop(&self) {
        self.worker.stop().await;
    }
}

async fn step(ctx: Arc<FanoutCtx>) -> StepHint {
    let handlers = (ctx.get_handlers)();
    if handlers.is_empty() {
        return StepHint::Satisfied;
    }

    match fanout_once(&ctx, &handlers).await {
        Ok(outcome) => {
            if outcome.produced_tasks {
                (ctx.on_new_tasks)();
            }
            if outcome.has_more {
                StepHint::Continue
            } else {
                StepHint::Satisfied
            }
        }
        Err(err) => {
            tracing::error!(
                service = %ctx.service_name,
                error = %err,
                "fanout transaction failed"
            );
            StepHint::Satisfied
        }
    }
}

async fn fanout_once(ctx: &FanoutCtx, handlers: &[EventHandler]) -> BusResult<FanoutOutcome> {
    let mut tx = ctx.pool.begin().await?;

    let fetch_sql = ctx.plans.fetch_events_past_cursor();
    let events: Vec<EventRow> = sqlx::query_as(&fetch_sql)
        .bind(&ctx.service_name)
        .bind(FETCH_SIZE as i64)
        .fetch_all(&mut *tx)
        .await?;

    if events.is_empty() {
        // nothing new, or another process holds the cursor lock
        tx.commit().await?;
        return Ok(FanoutOutcome {
            produced_tasks: false,
            has_more: false,
        });
    }

    let new_cursor = events.last().map(|event| event.position).unwrap_or(0);
    let tasks: Vec<InsertTask> = events
        .iter()
        .flat_map(|event| event_to_tasks(event, handlers, &ctx.factory))
        .collect();

    let advance_sql = ctx.plans.insert_tasks_and_advance_cursor();
    sqlx::query(&advance_sql)
        .bind(serde_json::to_string(&tasks)?)
        .bind(new_cursor)
        .bind(&ctx.service_name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::debug!(
        service = %ctx.service_name,
        events = events.len(),
        tasks = tasks.len(),
        cursor = new_cursor,
        "fanned out events"
    );

    Ok(FanoutOutcome {
        produced_tasks: !tasks.is_empty(),
        has_more: events.len() == FETCH_SIZE,
    })
}

/// One candidate task per handler registered on the event's name. Handler
/// config may be a function of the payload; it is invoked once per event,
/// inside the fanout transaction.
fn event_to_tasks(
    event: &EventRow,
    handlers: &[EventHandler],
    factory: &TaskFactory,
) -> Vec<InsertTask> {
    handlers
        .iter()
        .filter(|handler| handler.event_name() == event.event_name)
        .map(|handler| {
            let config = handler.handler_config().resolve(&event.event_data);
            let task = Task {
                task_name: handler.task_name().to_string(),
                queue: None,
                data: event.event_data.clone(),
                config,
            };
            factory.to_insert(
                &task,
                Trigger::Event {
                    e: EventTrigger {
                        id: event.id,
                        name: event.event_name.clone(),
                        p: event.position,
                    },
                },
            )
        })
        .collect()
}
