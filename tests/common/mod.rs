//! Shared helpers for integration tests.
//!
//! Every test gets its own database from `#[sqlx::test]` and its own schema
//! name, so buses under test never observe each other.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use tbus::{Bus, MaintenanceConfig, WorkerConfig};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// `RUST_LOG=tbus=debug cargo test` shows worker activity.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn random_schema() -> String {
    format!("tbus_{}", Uuid::new_v4().simple())
}

/// Worker knobs tightened for test latency.
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 10,
        interval_in_ms: 200,
        refill_pct: 0.33,
    }
}

pub fn fast_maintenance_config() -> MaintenanceConfig {
    MaintenanceConfig {
        retention_in_days: 30,
        interval_in_ms: 250,
    }
}

/// A bus on a shared pool, configured for fast polling. Not yet started, so
/// tests can register before the first claim.
pub async fn build_bus(pool: &PgPool, schema: &str, service: &str) -> Bus {
    init_tracing();
    Bus::builder(service)
        .schema(schema)
        .pool(pool.clone())
        .worker_config(fast_worker_config())
        .maintenance_config(fast_maintenance_config())
        .build()
        .await
        .expect("bus should build")
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_for<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {description}");
}

#[derive(Debug, sqlx::FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub queue: String,
    pub state: i16,
    pub retry_count: i32,
    pub data: JsonValue,
    pub output: Option<JsonValue>,
    pub singleton_key: Option<String>,
    pub completed_on: Option<DateTime<Utc>>,
}

/// All rows for one task name, oldest first.
pub async fn task_rows(pool: &PgPool, schema: &str, task_name: &str) -> Vec<TaskRow> {
    sqlx::query_as(&format!(
        "SELECT id, queue, state, retry_count, data, output, singleton_key, completed_on
         FROM {schema}.tasks WHERE data->>'tn' = $1 ORDER BY created_on ASC"
    ))
    .bind(task_name)
    .fetch_all(pool)
    .await
    .expect("tasks should be queryable")
}

pub async fn task_row(pool: &PgPool, schema: &str, task_name: &str) -> Option<TaskRow> {
    task_rows(pool, schema, task_name).await.into_iter().next()
}

pub async fn count_tasks(pool: &PgPool, schema: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT count(*) FROM {schema}.tasks"))
        .fetch_one(pool)
        .await
        .expect("tasks should be countable")
}

pub async fn count_events(pool: &PgPool, schema: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT count(*) FROM {schema}.events"))
        .fetch_one(pool)
        .await
        .expect("events should be countable")
}
