//! The maintenance worker: periodic sweeps that keep the schema healthy.
//!
//! Each tick expires overdue active tasks, purges terminal rows past their
//! retention, and ages out old events. Every sweep is idempotent and safe to
//! run from multiple processes at once.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::sql::Plans;
use crate::types::MaintenanceConfig;
use crate::workers::base::{StepHint, Worker};

struct MaintenanceCtx {
    pool: PgPool,
    plans: Plans,
    retention_in_days: i32,
}

pub(crate) struct MaintenanceWorker {
    worker: Worker,
}

impl MaintenanceWorker {
    pub fn new(pool: PgPool, plans: Plans, config: &MaintenanceConfig) -> Self {
        let ctx = Arc::new(MaintenanceCtx {
            pool,
            plans,
            retention_in_days: config.retention_in_days,
        });

        let worker = Worker::new(Duration::from_millis(config.interval_in_ms), move || {
            let ctx = ctx.clone();
            async move { step(ctx).await }
        });

        Self { worker }
    }

    pub fn start(&self) {
        self.worker.start();
    }

    pub async fn stop(&self) {
        self.worker.stop().await;
    }
}

async fn step(ctx: Arc<MaintenanceCtx>) -> StepHint {
    // independent sweeps: one failing does not stop the others
    if let Err(err) = sqlx::query(&ctx.plans.expire_tasks())
        .execute(&ctx.pool)
        .await
    {
        tracing::error!(error = %err, "failed to expire tasks");
    }

    if let Err(err) = sqlx::query(&ctx.plans.purge_tasks())
        .execute(&ctx.pool)
        .await
    {
        tracing::error!(error = %err, "failed to purge tasks");
    }

    if let Err(err) = sqlx::query(&ctx.plans.delete_expired_events())
        .bind(ctx.retention_in_days)
        .execute(&ctx.pool)
        .await
    {
        tracing::error!(error = %err, "failed to delete expired events");
    }

    StepHint::Satisfied
}
