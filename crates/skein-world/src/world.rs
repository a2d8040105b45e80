// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The world facade.
//!
//! [`World::open`] detects the back-end from the configuration, wires the
//! adapter, storage, streamer, queue and identity provider, and hands back
//! one object the engine talks to. Construction picks the back-end once;
//! everything afterwards is a monomorphic method call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::adapter::{DbAdapter, DbPool};
use crate::auth::{AuthProvider, StaticAuthProvider};
use crate::config::WorldConfig;
use crate::error::{Result, WorldError};
use crate::executor::Executor;
use crate::health::{self, HealthReport};
use crate::migrations;
use crate::queue::JobQueue;
use crate::storage::{MySqlStorage, PostgresStorage, SqliteStorage, Storage};
use crate::stream::Streamer;

/// The assembled storage/queue/streaming substrate.
pub struct World {
    config: WorldConfig,
    adapter: DbAdapter,
    storage: Arc<dyn Storage>,
    queue: Arc<JobQueue>,
    streamer: Arc<Streamer>,
    auth: Arc<dyn AuthProvider>,
    started: AtomicBool,
}

impl World {
    /// Open a world with a default (empty) static identity.
    pub async fn open(config: WorldConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        Self::open_with_auth(config, executor, Arc::new(StaticAuthProvider::default())).await
    }

    /// Open a world with an explicit identity provider.
    pub async fn open_with_auth(
        config: WorldConfig,
        executor: Arc<dyn Executor>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self> {
        let adapter = DbAdapter::open(&config).await?;

        let storage: Arc<dyn Storage> = match adapter.pool() {
            DbPool::Postgres(pool) => Arc::new(PostgresStorage::new(pool.clone())),
            DbPool::MySql(pool) => Arc::new(MySqlStorage::new(pool.clone())),
            DbPool::Sqlite(pool) => Arc::new(SqliteStorage::new(pool.clone())),
        };

        let streamer = Arc::new(Streamer::new(storage.clone(), adapter.clone()));
        let queue = Arc::new(JobQueue::new(
            storage.clone(),
            adapter.clone(),
            executor,
            config.job_prefix.clone(),
            config.queue_concurrency,
        ));

        info!(
            backend = %config.database_kind,
            job_prefix = %config.job_prefix,
            "world opened"
        );

        Ok(Self {
            config,
            adapter,
            storage,
            queue,
            streamer,
            auth,
            started: AtomicBool::new(false),
        })
    }

    /// The configuration this world was opened with.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// The database adapter.
    pub fn adapter(&self) -> &DbAdapter {
        &self.adapter
    }

    /// Durable CRUD over runs, steps, events and hooks.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The embedded job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The byte-stream layer.
    pub fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    /// The identity provider.
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// Apply the embedded schema for the configured back-end. Safe to call
    /// repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        match self.adapter.pool() {
            DbPool::Postgres(pool) => migrations::run_postgres(pool)
                .await
                .map_err(|e| WorldError::database("migrate", e)),
            DbPool::MySql(pool) => migrations::run_mysql(pool)
                .await
                .map_err(|e| WorldError::database("migrate", e)),
            DbPool::Sqlite(pool) => migrations::run_sqlite(pool)
                .await
                .map_err(|e| WorldError::database("migrate", e)),
        }
    }

    /// Validate the database connection and start the queue workers.
    /// Idempotent after the first success.
    pub async fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.adapter.connect().await?;
        self.queue.start().await?;
        self.started.store(true, Ordering::SeqCst);

        info!(backend = %self.config.database_kind, "world started");
        Ok(())
    }

    /// Stop the queue workers and stream dispatchers, then drain the pool.
    /// In-flight job handlers run to completion. A stopped world is not
    /// restartable.
    pub async fn stop(&self) {
        self.queue.stop().await;
        self.streamer.shutdown();
        self.adapter.disconnect().await;
        info!(backend = %self.config.database_kind, "world stopped");
    }

    /// Aggregate health of the adapter, storage and identity provider.
    pub async fn health(&self) -> HealthReport {
        health::check(&self.adapter, &self.storage, &self.auth).await
    }
}
