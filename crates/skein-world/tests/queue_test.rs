// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queue integration tests over SQLite.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use common::{
    AlwaysFailExecutor, FlakyExecutor, NoopExecutor, RecordingExecutor, sqlite_world, wait_for_job,
};
use skein_world::EnqueueOptions;

#[tokio::test]
async fn test_enqueue_rejects_unknown_queue_name() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;

    let err = ctx
        .world
        .queue()
        .enqueue("mystery_queue", &json!({}), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_QUEUE_NAME");
}

#[tokio::test]
async fn test_enqueue_is_idempotent_by_key() {
    let ctx = sqlite_world(Arc::new(NoopExecutor)).await;
    let queue = ctx.world.queue();

    let options = EnqueueOptions {
        idempotency_key: Some("K".to_string()),
    };
    let first = queue
        .enqueue("__wkf_workflow_abc", &json!({"n": 1}), options.clone())
        .await
        .unwrap();
    let second = queue
        .enqueue("__wkf_workflow_abc", &json!({"n": 1}), options)
        .await
        .unwrap();
    assert_eq!(first.message_id, second.message_id);

    // Exactly one row exists for the key.
    let row = ctx
        .world
        .storage()
        .find_job_by_idempotency_key("K")
        .await
        .unwrap()
        .expect("job row should exist");
    assert_eq!(row.id, first.message_id);

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM workflow_jobs WHERE idempotency_key = 'K'")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    // A different key inserts a fresh job.
    let third = queue
        .enqueue(
            "__wkf_workflow_abc",
            &json!({"n": 1}),
            EnqueueOptions {
                idempotency_key: Some("K2".to_string()),
            },
        )
        .await
        .unwrap();
    assert_ne!(third.message_id, first.message_id);
}

#[tokio::test]
async fn test_worker_dispatches_to_executor() {
    let executor = Arc::new(RecordingExecutor::default());
    let ctx = sqlite_world(executor.clone()).await;
    ctx.world.start().await.unwrap();

    let enqueued = ctx
        .world
        .queue()
        .enqueue(
            "__wkf_workflow_order-sync",
            &json!({"orderId": 42}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let job = wait_for_job(
        &ctx.world,
        &enqueued.message_id,
        "completed",
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(job.attempts, 1);
    assert!(job.locked_until.is_none());

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (queue_name, message) = &calls[0];
    assert_eq!(queue_name, "__wkf_workflow_order-sync");
    assert_eq!(message.id, "order-sync");
    assert_eq!(message.data, json!({"orderId": 42}));
    assert_eq!(message.attempt, 1);
    assert_eq!(message.message_id, enqueued.message_id);

    ctx.world.stop().await;
}

#[tokio::test]
async fn test_step_queue_reconstructs_inner_name() {
    let executor = Arc::new(RecordingExecutor::default());
    let ctx = sqlite_world(executor.clone()).await;
    ctx.world.start().await.unwrap();

    let enqueued = ctx
        .world
        .queue()
        .enqueue("__wkf_step_fetch-1", &json!(null), EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_job(
        &ctx.world,
        &enqueued.message_id,
        "completed",
        Duration::from_secs(5),
    )
    .await;

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls[0].0, "__wkf_step_fetch-1");

    // The job row itself lives on the steps job-queue.
    let job = ctx
        .world
        .storage()
        .get_job(&enqueued.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.queue_name, "workflow_steps");

    ctx.world.stop().await;
}

#[tokio::test]
async fn test_retry_then_succeed() {
    let executor = Arc::new(FlakyExecutor::new(2));
    let ctx = sqlite_world(executor.clone()).await;
    ctx.world.start().await.unwrap();

    let started = Instant::now();
    let enqueued = ctx
        .world
        .queue()
        .enqueue("__wkf_workflow_abc", &json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let job = wait_for_job(
        &ctx.world,
        &enqueued.message_id,
        "completed",
        Duration::from_secs(30),
    )
    .await;
    assert_eq!(job.attempts, 3);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    // Backoff of 2s after the first failure and 4s after the second.
    assert!(
        started.elapsed() >= Duration::from_secs(6),
        "retries came back too fast: {:?}",
        started.elapsed()
    );

    ctx.world.stop().await;
}

#[tokio::test]
async fn test_retry_ladder_exhausts_to_failed() {
    let executor = Arc::new(AlwaysFailExecutor::default());
    let ctx = sqlite_world(executor.clone()).await;
    ctx.world.start().await.unwrap();

    let enqueued = ctx
        .world
        .queue()
        .enqueue("__wkf_workflow_abc", &json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let job = wait_for_job(
        &ctx.world,
        &enqueued.message_id,
        "failed",
        Duration::from_secs(30),
    )
    .await;
    assert_eq!(job.attempts, 3);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    assert!(job.locked_until.is_none());
    assert!(
        job.error
            .as_deref()
            .is_some_and(|e| e.contains("handler always fails")),
        "error text missing: {:?}",
        job.error
    );

    ctx.world.stop().await;
}

#[tokio::test]
async fn test_expired_lease_is_stolen() {
    let executor = Arc::new(RecordingExecutor::default());
    let ctx = sqlite_world(executor.clone()).await;

    // Enqueue before the workers run, then simulate a worker that died
    // mid-lease: processing, lock expired, no attempts recorded.
    let enqueued = ctx
        .world
        .queue()
        .enqueue("__wkf_workflow_abc", &json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    sqlx::query(
        "UPDATE workflow_jobs SET status = 'processing', locked_until = ?, attempts = 0 WHERE id = ?",
    )
    .bind(Utc::now() - chrono::Duration::seconds(1))
    .bind(&enqueued.message_id)
    .execute(&ctx.pool)
    .await
    .unwrap();

    ctx.world.start().await.unwrap();

    let job = wait_for_job(
        &ctx.world,
        &enqueued.message_id,
        "completed",
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(job.attempts, 1);
    assert_eq!(executor.calls.lock().unwrap().len(), 1);

    ctx.world.stop().await;
}

#[tokio::test]
async fn test_unexpired_lease_is_not_stolen() {
    let executor = Arc::new(RecordingExecutor::default());
    let ctx = sqlite_world(executor.clone()).await;

    let enqueued = ctx
        .world
        .queue()
        .enqueue("__wkf_workflow_abc", &json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    sqlx::query(
        "UPDATE workflow_jobs SET status = 'processing', locked_until = ?, attempts = 1 WHERE id = ?",
    )
    .bind(Utc::now() + chrono::Duration::seconds(60))
    .bind(&enqueued.message_id)
    .execute(&ctx.pool)
    .await
    .unwrap();

    ctx.world.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    // Still held by the (simulated) other worker.
    let job = ctx
        .world
        .storage()
        .get_job(&enqueued.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "processing");
    assert!(executor.calls.lock().unwrap().is_empty());

    ctx.world.stop().await;
}

#[tokio::test]
async fn test_stopped_queue_leaves_jobs_pending() {
    let executor = Arc::new(RecordingExecutor::default());
    let ctx = sqlite_world(executor.clone()).await;
    ctx.world.start().await.unwrap();
    // Stop only the workers; the pool stays open for the enqueue below.
    ctx.world.queue().stop().await;

    let enqueued = ctx
        .world
        .queue()
        .enqueue("__wkf_workflow_abc", &json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let job = ctx
        .world
        .storage()
        .get_job(&enqueued.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, "pending");
    assert!(executor.calls.lock().unwrap().is_empty());
}
