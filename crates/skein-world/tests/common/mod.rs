// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for skein-world integration tests.
//!
//! SQLite tests run everywhere against a tempfile database. PostgreSQL
//! variants are gated on `TEST_DATABASE_URL` via [`postgres_world`].

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use skein_world::queue::MessageData;
use skein_world::{AuthContext, Executor, JobRecord, World, WorldConfig};

/// A world over a tempfile SQLite database, with raw pool access for
/// fixture manipulation.
pub struct TestWorld {
    pub world: World,
    pub pool: sqlx::SqlitePool,
    _dir: tempfile::TempDir,
}

/// Initialize test logging once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open (and migrate) a SQLite-backed world. Workers are not started;
/// call `world.start()` where a test needs them.
pub async fn sqlite_world(executor: Arc<dyn Executor>) -> TestWorld {
    init_tracing();
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("world.db");

    let mut config = WorldConfig::new(path.to_string_lossy().to_string());
    config.queue_concurrency = 2;

    let world = World::open(config, executor)
        .await
        .expect("failed to open world");
    world.migrate().await.expect("failed to migrate");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(sqlx::sqlite::SqliteConnectOptions::new().filename(&path))
        .await
        .expect("failed to open raw pool");

    TestWorld {
        world,
        pool,
        _dir: dir,
    }
}

/// Open a PostgreSQL-backed world from `TEST_DATABASE_URL`, or `None` to
/// skip the test. The job prefix isolates queue tests sharing one server.
pub async fn postgres_world(executor: Arc<dyn Executor>, job_prefix: &str) -> Option<World> {
    dotenvy::dotenv().ok();
    init_tracing();
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let mut config = WorldConfig::new(url);
    config.job_prefix = job_prefix.to_string();
    config.queue_concurrency = 2;

    let world = World::open(config, executor).await.ok()?;
    world.migrate().await.ok()?;
    Some(world)
}

/// Open a MySQL-backed world from `TEST_MYSQL_URL`, or `None` to skip the
/// test.
pub async fn mysql_world(executor: Arc<dyn Executor>, job_prefix: &str) -> Option<World> {
    dotenvy::dotenv().ok();
    init_tracing();
    let url = std::env::var("TEST_MYSQL_URL").ok()?;
    let mut config = WorldConfig::new(url);
    config.job_prefix = job_prefix.to_string();
    config.queue_concurrency = 2;

    let world = World::open(config, executor).await.ok()?;
    world.migrate().await.ok()?;
    Some(world)
}

/// Unique suffix for test entities sharing a database server.
pub fn unique_tag(label: &str) -> String {
    use std::sync::atomic::AtomicU64;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{label}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Identity used by hook tests.
pub fn test_auth() -> AuthContext {
    AuthContext {
        environment: "test".to_string(),
        owner_id: "owner-1".to_string(),
        project_id: "project-1".to_string(),
    }
}

/// Poll a job row until it reaches `status` or the timeout expires.
pub async fn wait_for_job(world: &World, job_id: &str, status: &str, timeout: Duration) -> JobRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = world
            .storage()
            .get_job(job_id)
            .await
            .expect("get_job failed");
        if let Some(job) = job {
            if job.status == status {
                return job;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "job {job_id} never reached '{status}'; currently '{}' after {} attempts",
                    job.status, job.attempts
                );
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} not found");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Test executors
// ============================================================================

/// Succeeds on every dispatch.
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute(&self, _queue_name: &str, _message: MessageData) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

/// Records every dispatch and succeeds.
#[derive(Default)]
pub struct RecordingExecutor {
    pub calls: Mutex<Vec<(String, MessageData)>>,
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, queue_name: &str, message: MessageData) -> anyhow::Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((queue_name.to_string(), message));
        Ok(json!({"ok": true}))
    }
}

/// Fails the first `failures` dispatches, then succeeds.
pub struct FlakyExecutor {
    failures_remaining: AtomicI64,
    pub calls: AtomicUsize,
}

impl FlakyExecutor {
    pub fn new(failures: i64) -> Self {
        Self {
            failures_remaining: AtomicI64::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn execute(&self, _queue_name: &str, _message: MessageData) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            anyhow::bail!("simulated handler failure");
        }
        Ok(Value::Null)
    }
}

/// Fails every dispatch.
#[derive(Default)]
pub struct AlwaysFailExecutor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Executor for AlwaysFailExecutor {
    async fn execute(&self, _queue_name: &str, _message: MessageData) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("handler always fails")
    }
}
