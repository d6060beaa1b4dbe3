//! The task worker: claim, dispatch, time-bound, resolve.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batcher::{BatchItem, Batcher};
use crate::definitions::{HandlerFn, TaskInvocation};
use crate::error::serialize_error;
use crate::sql::Plans;
use crate::types::{ClaimedTask, ClaimedTaskRow, Resolution, WorkerConfig};
use crate::workers::base::{Notifier, StepHint, Worker};

/// Batch limits for the resolve pipeline: payloads can be big, so the batch
/// stays small; latency stays low so completions land quickly.
const RESOLVE_BATCH_SIZE: usize = 100;
const RESOLVE_BATCH_TIME: Duration = Duration::from_millis(60);

/// Normalise a handler's return value into the persisted `task.output` shape:
/// null stays null, a plain object is stored as-is, anything else is wrapped
/// as `{"value": v}`.
pub(crate) fn normalize_output(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => JsonValue::Null,
        JsonValue::Object(map) => JsonValue::Object(map),
        other => json!({ "value": other }),
    }
}

/// Race a handler invocation against the task's execution deadline.
///
/// The handler runs as its own task and is not interrupted when the deadline
/// wins; it may continue to completion and be ignored. The row itself is
/// re-driven by maintenance if it stays active past its expiration.
pub(crate) async fn resolve_within_seconds(
    fut: crate::definitions::HandlerFuture,
    seconds: i32,
) -> anyhow::Result<JsonValue> {
    let timeout_ms = u64::try_from(seconds.max(1)).unwrap_or(1) * 1000;
    let join = tokio::spawn(fut);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), join).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(anyhow::anyhow!("handler panicked: {join_err}")),
        Err(_) => Err(anyhow::anyhow!("handler execution exceeded {timeout_ms}ms")),
    }
}

struct TaskCtx {
    pool: PgPool,
    plans: Plans,
    queue: String,
    max_concurrency: usize,
    refill_threshold_pct: f64,
    handler: HandlerFn,
    /// Active-task ledger: one entry per in-flight dispatch.
    active: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Whether the last fetch filled its request, i.e. more rows are likely
    /// waiting.
    has_more: AtomicBool,
    batcher: Batcher<Resolution>,
    notifier: OnceLock<Notifier>,
}

impl TaskCtx {
    fn active_count(&self) -> usize {
        self.active.lock().expect("ledger lock poisoned").len()
    }

    fn notify_self(&self) {
        if let Some(notifier) = self.notifier.get() {
            notifier.notify();
        }
    }
}

/// Fetches runnable tasks for one queue, dispatches them with a per-task
/// deadline, and streams completions through the resolve batcher.
pub(crate) struct TaskWorker {
    worker: Worker,
    ctx: Arc<TaskCtx>,
}

impl TaskWorker {
    pub fn new(
        pool: PgPool,
        plans: Plans,
        queue: impl Into<String>,
        config: &WorkerConfig,
        handler: HandlerFn,
    ) -> Self {
        let resolve_sql = plans.resolve_tasks();
        let batcher_pool = pool.clone();
        let batcher = Batcher::new(
            move |batch: Vec<BatchItem<Resolution>>| {
                let pool = batcher_pool.clone();
                let sql = resolve_sql.clone();
                async move {
                    flush_resolutions(&pool, &sql, batch).await;
                }
            },
            RESOLVE_BATCH_SIZE,
            RESOLVE_BATCH_TIME,
        );

        let ctx = Arc::new(TaskCtx {
            pool,
            plans,
            queue: queue.into(),
            max_concurrency: config.concurrency,
            refill_threshold_pct: config.refill_pct,
            handler,
            active: Mutex::new(HashMap::new()),
            has_more: AtomicBool::new(false),
            batcher,
            notifier: OnceLock::new(),
        });

        let step_ctx = ctx.clone();
        let worker = Worker::new(
            Duration::from_millis(config.interval_in_ms),
            move || {
                let ctx = step_ctx.clone();
                async move { step(ctx).await }
            },
        );
        let _ = ctx.notifier.set(worker.notifier());

        Self { worker, ctx }
    }

    pub fn start(&self) {
        self.worker.start();
    }

    pub fn notify(&self) {
        self.worker.notify();
    }

    /// Stop fetching, drain in-flight dispatches, then flush pending
    /// resolutions.
    pub async fn stop(&self) {
        self.worker.stop().await;

        let handles: Vec<JoinHandle<()>> = {
            let mut active = self.ctx.active.lock().expect("ledger lock poisoned");
            active.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        self.ctx.batcher.flush().await;
    }
}

async fn step(ctx: Arc<TaskCtx>) -> StepHint {
    let active = ctx.active_count();
    if active >= ctx.max_concurrency {
        return StepHint::Satisfied;
    }
    let request = ctx.max_concurrency - active;

    let sql = ctx.plans.claim_tasks();
    let rows: Vec<ClaimedTaskRow> = match sqlx::query_as(&sql)
        .bind(&ctx.queue)
        .bind(request as i64)
        .fetch_all(&ctx.pool)
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(queue = %ctx.queue, error = %err, "failed to claim tasks");
            return StepHint::Satisfied;
        }
    };

    if rows.is_empty() {
        ctx.has_more.store(false, Ordering::SeqCst);
        return StepHint::Satisfied;
    }

    let has_more = rows.len() == request;
    ctx.has_more.store(has_more, Ordering::SeqCst);

    for row in rows {
        let task: ClaimedTask = match row.try_into() {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(queue = %ctx.queue, error = %err, "claimed task is not decodable");
                continue;
            }
        };
        dispatch(ctx.clone(), task);
    }

    if has_more {
        StepHint::Continue
    } else {
        StepHint::Satisfied
    }
}

/// Start one handler invocation, bounded by the task's deadline, and record
/// it in the active ledger. The ledger entry is inserted before the dispatch
/// body is allowed to run, so the completion path always observes it.
fn dispatch(ctx: Arc<TaskCtx>, task: ClaimedTask) {
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
    let task_id = task.id;

    let dispatch_ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let _ = ready_rx.await;
        let ctx = dispatch_ctx;

        let invocation = TaskInvocation {
            name: task.data.tn.clone(),
            input: task.data.data.clone(),
            trigger: task.data.trace.clone(),
        };

        let result = resolve_within_seconds((ctx.handler)(invocation), task.expire_in_seconds).await;
        let resolution = match result {
            Ok(value) => Resolution {
                task_id,
                success: true,
                payload: normalize_output(value),
            },
            Err(err) => Resolution {
                task_id,
                success: false,
                payload: serialize_error(&err),
            },
        };
        ctx.batcher.add(resolution);

        let remaining = {
            let mut active = ctx.active.lock().expect("ledger lock poisoned");
            active.remove(&task_id);
            active.len()
        };

        let below_threshold =
            (remaining as f64) < ctx.refill_threshold_pct * ctx.max_concurrency as f64;
        if below_threshold && ctx.has_more.load(Ordering::SeqCst) {
            ctx.notify_self();
        }
    });

    ctx.active
        .lock()
        .expect("ledger lock poisoned")
        .insert(task_id, handle);
    let _ = ready_tx.send(());
}

async fn flush_resolutions(pool: &PgPool, sql: &str, batch: Vec<BatchItem<Resolution>>) {
    let max_delta = batch.iter().map(|item| item.delta_ms).max().unwrap_or(0);
    let resolutions: Vec<&Resolution> = batch.iter().map(|item| &item.item).collect();
    let payload = match serde_json::to_string(&resolutions) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize resolution batch");
            return;
        }
    };

    tracing::debug!(
        batch = resolutions.len(),
        max_delta_ms = max_delta,
        "resolving tasks"
    );

    // A lost batch is not fatal: the rows stay active and are re-driven by
    // maintenance once their deadline passes.
    if let Err(err) = sqlx::query(sql).bind(payload).execute(pool).await {
        tracing::error!(error = %err, "failed to resolve task batch");
    }
}
