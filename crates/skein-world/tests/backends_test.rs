// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-backed integration tests.
//!
//! PostgreSQL tests need `TEST_DATABASE_URL`, MySQL tests `TEST_MYSQL_URL`;
//! without them the tests skip. These exercise the code paths SQLite
//! cannot: LISTEN/NOTIFY delivery and the MySQL returning-compat layer.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{
    NoopExecutor, RecordingExecutor, mysql_world, postgres_world, test_auth, unique_tag,
    wait_for_job,
};
use skein_world::{
    EnqueueOptions, ListRunsParams, NewHook, NewRun, NewStep, RunStatus, RunUpdate,
};

fn new_run(workflow_name: &str) -> NewRun {
    NewRun {
        run_id: None,
        deployment_id: "d1".to_string(),
        workflow_name: workflow_name.to_string(),
        input: json!([{"x": 1}]),
        execution_context: None,
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[tokio::test]
async fn test_postgres_run_round_trip() {
    let Some(world) = postgres_world(Arc::new(NoopExecutor), "pg_rt_").await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let storage = world.storage();

    let run = storage.create_run(new_run(&unique_tag("pg-rt"))).await.unwrap();
    assert_eq!(run.status, "pending");
    assert_eq!(run.input, json!([{"x": 1}]));

    let running = storage
        .update_run(
            &run.run_id,
            RunUpdate {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(running.started_at.is_some());

    let completed = storage
        .update_run(
            &run.run_id,
            RunUpdate {
                status: Some(RunStatus::Completed),
                output: Some(json!([{"y": 2}])),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.output, Some(json!([{"y": 2}])));
    assert!(completed.completed_at.is_some());
}

#[tokio::test]
async fn test_postgres_pagination() {
    let Some(world) = postgres_world(Arc::new(NoopExecutor), "pg_pg_").await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let storage = world.storage();
    let workflow_name = unique_tag("pg-paged");

    let mut all_ids = HashSet::new();
    for _ in 0..25 {
        let run = storage.create_run(new_run(&workflow_name)).await.unwrap();
        all_ids.insert(run.run_id);
    }

    let mut collected = HashSet::new();
    let mut cursor = None;
    let mut flags = Vec::new();
    loop {
        let page = storage
            .list_runs(ListRunsParams {
                workflow_name: Some(workflow_name.clone()),
                limit: 10,
                cursor: cursor.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        flags.push(page.has_more);
        collected.extend(page.items.iter().map(|r| r.run_id.clone()));
        cursor = page.cursor.clone();
        if !page.has_more {
            break;
        }
    }

    assert_eq!(flags, vec![true, true, false]);
    assert_eq!(collected, all_ids);
}

#[tokio::test]
async fn test_postgres_queue_dispatch() {
    let executor = Arc::new(RecordingExecutor::default());
    let prefix = format!("{}_", unique_tag("pgq"));
    let Some(world) = postgres_world(executor.clone(), &prefix).await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    world.start().await.unwrap();

    let queue_id = unique_tag("flow");
    let enqueued = world
        .queue()
        .enqueue(
            &format!("__wkf_workflow_{queue_id}"),
            &json!({"n": 7}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let job = wait_for_job(&world, &enqueued.message_id, "completed", Duration::from_secs(10)).await;
    assert_eq!(job.attempts, 1);

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, format!("__wkf_workflow_{queue_id}"));
    drop(calls);

    world.stop().await;
}

#[tokio::test]
async fn test_postgres_stream_live_delivery() {
    let Some(world) = postgres_world(Arc::new(NoopExecutor), "pg_st_").await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let streamer = world.streamer();
    let stream_id = unique_tag("strm");

    streamer.write_to_stream(&stream_id, b"ab").await.unwrap();

    let mut reader = streamer.read_from_stream(&stream_id, None).await.unwrap();
    let collect = tokio::spawn(async move { reader.read_to_end().await });

    // Give the reader a beat to subscribe, then write through NOTIFY.
    tokio::time::sleep(Duration::from_millis(200)).await;
    streamer.write_to_stream(&stream_id, b"cd").await.unwrap();
    streamer.close_stream(&stream_id).await.unwrap();

    let bytes = tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("reader did not terminate")
        .unwrap()
        .unwrap();
    assert_eq!(bytes, b"abcd");
}

// ============================================================================
// MySQL (returning-compat paths)
// ============================================================================

#[tokio::test]
async fn test_mysql_run_round_trip() {
    let Some(world) = mysql_world(Arc::new(NoopExecutor), "my_rt_").await else {
        eprintln!("Skipping test: TEST_MYSQL_URL not set");
        return;
    };
    let storage = world.storage();

    let run = storage.create_run(new_run(&unique_tag("my-rt"))).await.unwrap();
    assert_eq!(run.status, "pending");

    // Duplicate primary key is a pre-checked conflict on MySQL.
    let mut duplicate = new_run("my-dup");
    duplicate.run_id = Some(run.run_id.clone());
    let err = storage.create_run(duplicate).await.unwrap_err();
    assert!(err.is_conflict());

    let completed = storage
        .update_run(
            &run.run_id,
            RunUpdate {
                status: Some(RunStatus::Completed),
                output: Some(json!([1])),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.status, "completed");
    assert!(completed.completed_at.is_some());
}

#[tokio::test]
async fn test_mysql_step_create_is_idempotent() {
    let Some(world) = mysql_world(Arc::new(NoopExecutor), "my_st_").await else {
        eprintln!("Skipping test: TEST_MYSQL_URL not set");
        return;
    };
    let storage = world.storage();

    let run = storage.create_run(new_run(&unique_tag("my-step"))).await.unwrap();
    let new = NewStep {
        step_id: Some(format!("wstp_{}", unique_tag("fixed"))),
        run_id: run.run_id.clone(),
        step_name: "fetch".to_string(),
        input: json!([1]),
        attempt: 1,
    };

    let first = storage.create_step(new.clone()).await.unwrap();
    // The duplicate-key error (1062) degrades to a read-back.
    let second = storage.create_step(new).await.unwrap();
    assert_eq!(second.step_id, first.step_id);

    let steps = storage.list_steps(&run.run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
}

#[tokio::test]
async fn test_mysql_dispose_hook_returns_prior_row() {
    let Some(world) = mysql_world(Arc::new(NoopExecutor), "my_hk_").await else {
        eprintln!("Skipping test: TEST_MYSQL_URL not set");
        return;
    };
    let storage = world.storage();

    let run = storage.create_run(new_run(&unique_tag("my-hook"))).await.unwrap();
    let token = unique_tag("tok");
    let hook = storage
        .create_hook(
            NewHook {
                hook_id: None,
                run_id: run.run_id.clone(),
                token: token.clone(),
                metadata: json!({"k": 1}),
            },
            &test_auth(),
        )
        .await
        .unwrap();

    let disposed = storage.dispose_hook(&hook.hook_id).await.unwrap();
    assert_eq!(disposed.token, token);
    assert_eq!(disposed.metadata, json!({"k": 1}));

    let err = storage.dispose_hook(&hook.hook_id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_mysql_queue_dispatch() {
    let executor = Arc::new(RecordingExecutor::default());
    let prefix = format!("{}_", unique_tag("myq"));
    let Some(world) = mysql_world(executor.clone(), &prefix).await else {
        eprintln!("Skipping test: TEST_MYSQL_URL not set");
        return;
    };
    world.start().await.unwrap();

    let queue_id = unique_tag("step");
    let enqueued = world
        .queue()
        .enqueue(
            &format!("__wkf_step_{queue_id}"),
            &json!(null),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let job = wait_for_job(&world, &enqueued.message_id, "completed", Duration::from_secs(10)).await;
    assert_eq!(job.attempts, 1);
    assert_eq!(job.queue_name, format!("{prefix}steps"));

    world.stop().await;
}
