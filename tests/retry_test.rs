#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tbus::{HandlerError, TaskDefinition, TaskOverrides, TaskState};

use common::*;

#[sqlx::test(migrations = false)]
async fn failed_attempts_are_retried_until_success(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "svc").await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let flaky = TaskDefinition::new("flaky", json!({"type": "object"}), move |_| {
        let seen = seen.clone();
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("still warming up");
            }
            Ok(json!({"ok": true}))
        }
    })
    .unwrap()
    .config(TaskOverrides {
        retry_limit: Some(2),
        retry_delay: Some(0),
        ..Default::default()
    });
    bus.register_task(flaky.clone()).unwrap();
    bus.start().await.unwrap();

    bus.send(flaky.from(json!({})).unwrap()).await.unwrap();

    wait_for("the task to complete after retries", || {
        let (pool, schema) = (pool.clone(), schema.clone());
        async move {
            task_row(&pool, &schema, "flaky")
                .await
                .is_some_and(|row| row.state == TaskState::Completed.as_i16())
        }
    })
    .await;

    let row = task_row(&pool, &schema, "flaky").await.unwrap();
    assert_eq!(row.retry_count, 2);
    assert_eq!(row.output, Some(json!({"ok": true})));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    bus.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn exhausted_retries_fail_with_the_error_record(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "svc").await;

    let doomed = TaskDefinition::new("doomed", json!({"type": "object"}), |_| async {
        Err(HandlerError::new("payment declined")
            .attr("code", json!("card_declined"))
            .attr("retryable", json!(false))
            .into())
    })
    .unwrap()
    .config(TaskOverrides {
        retry_limit: Some(1),
        retry_delay: Some(0),
        ..Default::default()
    });
    bus.register_task(doomed.clone()).unwrap();
    bus.start().await.unwrap();

    bus.send(doomed.from(json!({})).unwrap()).await.unwrap();

    wait_for("the task to fail terminally", || {
        let (pool, schema) = (pool.clone(), schema.clone());
        async move {
            task_row(&pool, &schema, "doomed")
                .await
                .is_some_and(|row| row.state == TaskState::Failed.as_i16())
        }
    })
    .await;

    let row = task_row(&pool, &schema, "doomed").await.unwrap();
    assert_eq!(row.retry_count, 1);
    assert!(row.completed_on.is_some());

    let output = row.output.unwrap();
    assert_eq!(output["name"], json!("Error"));
    assert_eq!(output["message"], json!("payment declined"));
    assert_eq!(output["code"], json!("card_declined"));
    assert_eq!(output["retryable"], json!(false));
    assert!(output["stack"].is_string());

    bus.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn overrunning_handlers_fail_with_the_deadline_error(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "svc").await;

    let slow = TaskDefinition::new("slow", json!({"type": "object"}), |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!(null))
    })
    .unwrap()
    .config(TaskOverrides {
        expire_in_seconds: Some(1),
        retry_limit: Some(0),
        ..Default::default()
    });
    bus.register_task(slow.clone()).unwrap();
    bus.start().await.unwrap();

    bus.send(slow.from(json!({})).unwrap()).await.unwrap();

    wait_for("the deadline to fail the task", || {
        let (pool, schema) = (pool.clone(), schema.clone());
        async move {
            task_row(&pool, &schema, "slow")
                .await
                .is_some_and(|row| row.state == TaskState::Failed.as_i16())
        }
    })
    .await;

    let output = task_row(&pool, &schema, "slow").await.unwrap().output.unwrap();
    assert_eq!(output["message"], json!("handler execution exceeded 1000ms"));

    bus.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn unknown_tasks_fail_instead_of_blocking_the_queue(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "svc").await;
    bus.start().await.unwrap();

    // another service enqueues onto our queue a task we never registered
    let foreign = TaskDefinition::new("not_ours", json!({"type": "object"}), |_| async {
        Ok(json!(null))
    })
    .unwrap()
    .config(TaskOverrides {
        retry_limit: Some(0),
        ..Default::default()
    })
    .queue("svc");

    bus.send(foreign.from(json!({})).unwrap()).await.unwrap();

    wait_for("the unknown task to fail", || {
        let (pool, schema) = (pool.clone(), schema.clone());
        async move {
            task_row(&pool, &schema, "not_ours")
                .await
                .is_some_and(|row| row.state == TaskState::Failed.as_i16())
        }
    })
    .await;

    let output = task_row(&pool, &schema, "not_ours").await.unwrap().output.unwrap();
    assert_eq!(
        output["message"],
        json!("no handler registered for task not_ours")
    );

    bus.stop().await.unwrap();
}