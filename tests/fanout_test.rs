#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tbus::{EventDefinition, EventHandler, TaskOverrides, TaskState, Trigger};

use common::*;

fn order_placed() -> EventDefinition {
    EventDefinition::new(
        "order_placed",
        json!({
            "type": "object",
            "properties": {"order_id": {"type": "string"}},
            "required": ["order_id"],
        }),
    )
    .unwrap()
}

#[sqlx::test(migrations = false)]
async fn one_event_fans_out_to_every_registered_handler(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "order-svc").await;

    let event = order_placed();
    let billed = Arc::new(AtomicUsize::new(0));
    let shipped = Arc::new(AtomicUsize::new(0));

    let seen = billed.clone();
    bus.register_handler(EventHandler::new("bill_customer", &event, move |invocation| {
        let seen = seen.clone();
        async move {
            assert_eq!(invocation.input["order_id"], json!("o-1"));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    }))
    .unwrap();

    let seen = shipped.clone();
    bus.register_handler(EventHandler::new("ship_order", &event, move |_| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    }))
    .unwrap();

    bus.start().await.unwrap();
    bus.publish(event.from(json!({"order_id": "o-1"})).unwrap())
        .await
        .unwrap();

    wait_for("both fanned-out tasks to complete", || {
        let (billed, shipped) = (billed.clone(), shipped.clone());
        async move {
            billed.load(Ordering::SeqCst) == 1 && shipped.load(Ordering::SeqCst) == 1
        }
    })
    .await;

    // provenance points back at the originating event
    let row = task_row(&pool, &schema, "bill_customer").await.unwrap();
    let trace: Trigger = serde_json::from_value(row.data["trace"].clone()).unwrap();
    match trace {
        Trigger::Event { e } => {
            assert_eq!(e.name, "order_placed");
            assert!(e.p > 0);
        }
        Trigger::Direct => panic!("expected an event trigger"),
    }

    bus.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn new_services_start_at_the_event_tip(pool: PgPool) {
    let schema = random_schema();

    let producer = build_bus(&pool, &schema, "producer").await;
    producer.start().await.unwrap();

    let event = order_placed();
    producer
        .publish(event.from(json!({"order_id": "before"})).unwrap())
        .await
        .unwrap();

    // the consumer joins after the first event was published
    let consumer = build_bus(&pool, &schema, "consumer").await;
    let handled = Arc::new(AtomicUsize::new(0));
    let seen = handled.clone();
    consumer
        .register_handler(EventHandler::new("on_order", &event, move |invocation| {
            let seen = seen.clone();
            async move {
                assert_eq!(invocation.input["order_id"], json!("after"));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }))
        .unwrap();
    consumer.start().await.unwrap();

    producer
        .publish(event.from(json!({"order_id": "after"})).unwrap())
        .await
        .unwrap();

    wait_for("the post-start event to be handled", || {
        let seen = handled.clone();
        async move { seen.load(Ordering::SeqCst) == 1 }
    })
    .await;

    // only the post-start event produced a task
    assert_eq!(task_rows(&pool, &schema, "on_order").await.len(), 1);

    producer.stop().await.unwrap();
    consumer.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn transactional_publish_follows_the_surrounding_transaction(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "svc").await;
    bus.start().await.unwrap();

    let event = order_placed();

    let mut tx = pool.begin().await.unwrap();
    bus.publish_with(vec![event.from(json!({"order_id": "o-9"})).unwrap()], &mut *tx)
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(count_events(&pool, &schema).await, 0);

    let mut tx = pool.begin().await.unwrap();
    bus.publish_with(vec![event.from(json!({"order_id": "o-9"})).unwrap()], &mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(count_events(&pool, &schema).await, 1);

    bus.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn dynamic_handler_config_can_deduplicate_per_payload(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "svc").await;

    let event = order_placed();
    bus.register_handler(
        EventHandler::new("sync_order", &event, |_| async {
            // stays pending long enough for dedup to apply
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(json!(null))
        })
        .config_fn(|payload| TaskOverrides {
            singleton_key: payload["order_id"].as_str().map(String::from),
            ..Default::default()
        }),
    )
    .unwrap();
    bus.start().await.unwrap();

    let events: Vec<_> = ["o-1", "o-1", "o-2"]
        .iter()
        .map(|id| event.from(json!({"order_id": id})).unwrap())
        .collect();
    bus.publish_many(events).await.unwrap();

    wait_for("fanout to produce the deduplicated tasks", || {
        let (pool, schema) = (pool.clone(), schema.clone());
        async move { !task_rows(&pool, &schema, "sync_order").await.is_empty() }
    })
    .await;

    let rows = task_rows(&pool, &schema, "sync_order").await;
    assert_eq!(rows.len(), 2);
    let mut keys: Vec<_> = rows
        .iter()
        .map(|row| row.singleton_key.clone().unwrap())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["o-1", "o-2"]);

    bus.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn fanned_out_tasks_complete_like_direct_ones(pool: PgPool) {
    let schema = random_schema();
    let bus = build_bus(&pool, &schema, "svc").await;

    let event = order_placed();
    bus.register_handler(EventHandler::new("receipt", &event, |invocation| async move {
        Ok(json!({"receipt_for": invocation.input["order_id"]}))
    }))
    .unwrap();
    bus.start().await.unwrap();

    bus.publish(event.from(json!({"order_id": "o-3"})).unwrap())
        .await
        .unwrap();

    wait_for("the fanned-out task to complete", || {
        let (pool, schema) = (pool.clone(), schema.clone());
        async move {
            task_row(&pool, &schema, "receipt")
                .await
                .is_some_and(|row| row.state == TaskState::Completed.as_i16())
        }
    })
    .await;

    let row = task_row(&pool, &schema, "receipt").await.unwrap();
    assert_eq!(row.output, Some(json!({"receipt_for": "o-3"})));

    bus.stop().await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn two_instances_of_one_service_handle_each_event_once(pool: PgPool) {
    let schema = random_schema();
    let event = order_placed();
    let calls = Arc::new(AtomicUsize::new(0));

    // two instances of the same service share one cursor and one queue
    let mut instances = Vec::new();
    for _ in 0..2 {
        let bus = build_bus(&pool, &schema, "order-svc").await;
        let seen = calls.clone();
        bus.register_handler(EventHandler::new("settle", &event, move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        }))
        .unwrap();
        bus.start().await.unwrap();
        instances.push(bus);
    }

    instances[0]
        .publish(event.from(json!({"order_id": "o-7"})).unwrap())
        .await
        .unwrap();

    wait_for("the shared-service task to complete", || {
        let (pool, schema) = (pool.clone(), schema.clone());
        async move {
            task_row(&pool, &schema, "settle")
                .await
                .is_some_and(|row| row.state == TaskState::Completed.as_i16())
        }
    })
    .await;

    // both fanout workers race on the cursor, but the event yields exactly
    // one task and exactly one handler run across the pair
    assert_eq!(task_rows(&pool, &schema, "settle").await.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    for bus in instances {
        bus.stop().await.unwrap();
    }
}