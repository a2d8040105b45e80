// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded job queue: at-least-once, leased delivery over a single table.
//!
//! Callers enqueue onto `__wkf_workflow_<id>` or `__wkf_step_<id>` names;
//! the prefix maps to one of two job-queue names (`<job_prefix>flows`,
//! `<job_prefix>steps`) and the id travels inside the payload. Workers
//! lease jobs with a conditional UPDATE, dispatch to the injected
//! [`Executor`](crate::executor::Executor), and retry with exponential
//! backoff until `max_attempts`.
//!
//! All back-ends share the polling worker. On PostgreSQL an enqueue also
//! fires `pg_notify`, and a dedicated LISTEN connection nudges the workers
//! so dispatch latency is near-zero; the observable contract is identical.

pub mod worker;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::DbAdapter;
use crate::error::{Result, WorldError};
use crate::executor::Executor;
use crate::ids;
use crate::storage::{NewJob, Storage};

use self::worker::WorkerContext;

/// Caller-side queue-name prefix for workflow dispatches.
pub const WORKFLOW_QUEUE_PREFIX: &str = "__wkf_workflow_";

/// Caller-side queue-name prefix for step dispatches.
pub const STEP_QUEUE_PREFIX: &str = "__wkf_step_";

/// Attempts before a job is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// PostgreSQL notification channel for enqueue nudges.
const JOB_CHANNEL: &str = "workflow_job_enqueued";

/// Which of the two fixed queue families a name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// `__wkf_workflow_*`, dispatched on `<job_prefix>flows`.
    Workflow,
    /// `__wkf_step_*`, dispatched on `<job_prefix>steps`.
    Step,
}

impl QueueKind {
    /// The caller-side prefix for this family.
    pub fn caller_prefix(&self) -> &'static str {
        match self {
            Self::Workflow => WORKFLOW_QUEUE_PREFIX,
            Self::Step => STEP_QUEUE_PREFIX,
        }
    }

    /// The job-queue name rows of this family are stored under.
    pub fn job_queue_name(&self, job_prefix: &str) -> String {
        match self {
            Self::Workflow => format!("{job_prefix}flows"),
            Self::Step => format!("{job_prefix}steps"),
        }
    }
}

/// A parsed caller-side queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQueueName {
    /// Queue family.
    pub kind: QueueKind,
    /// The opaque id portion after the prefix.
    pub queue_id: String,
}

/// Parse a caller-side queue name; anything without a known prefix is a
/// validation error.
pub fn parse_queue_name(name: &str) -> Result<ParsedQueueName> {
    if let Some(id) = name.strip_prefix(WORKFLOW_QUEUE_PREFIX) {
        return Ok(ParsedQueueName {
            kind: QueueKind::Workflow,
            queue_id: id.to_string(),
        });
    }
    if let Some(id) = name.strip_prefix(STEP_QUEUE_PREFIX) {
        return Ok(ParsedQueueName {
            kind: QueueKind::Step,
            queue_id: id.to_string(),
        });
    }
    Err(WorldError::InvalidQueueName {
        name: name.to_string(),
    })
}

/// Wire payload stored in a job row. Field names are camelCase on the wire
/// for compatibility with existing payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    /// The id portion of the caller-side queue name.
    pub id: String,
    /// The caller's message, serialized as JSON.
    pub data: Value,
    /// Attempt number this dispatch is for, 1-based.
    pub attempt: u32,
    /// The job row id, `msg_<ulid>`.
    pub message_id: String,
    /// Deduplication key, when the caller supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Options for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Deduplicate by this key: a second enqueue with the same key returns
    /// the first job's id without inserting.
    pub idempotency_key: Option<String>,
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// The job id, `msg_<ulid>`.
    pub message_id: String,
}

/// Exponential retry backoff: `min(1000 * 2^attempts, 60000)` milliseconds.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exp = attempts.clamp(0, 16) as u32;
    let ms = 1000u64.saturating_mul(1u64 << exp).min(60_000);
    Duration::from_millis(ms)
}

/// The embedded job queue.
///
/// `enqueue` never blocks on workers; `start` spawns the worker loops
/// (idempotent per process) and `stop` lets in-flight handlers finish
/// before the workers exit.
pub struct JobQueue {
    storage: Arc<dyn Storage>,
    adapter: DbAdapter,
    executor: Arc<dyn Executor>,
    job_prefix: String,
    concurrency: usize,
    shutdown: watch::Sender<bool>,
    nudge: Arc<Notify>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Create a queue over the given storage and executor. Workers do not
    /// run until [`start`](Self::start).
    pub fn new(
        storage: Arc<dyn Storage>,
        adapter: DbAdapter,
        executor: Arc<dyn Executor>,
        job_prefix: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            storage,
            adapter,
            executor,
            job_prefix: job_prefix.into(),
            concurrency: concurrency.max(1),
            shutdown,
            nudge: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a message onto a caller-side queue name.
    ///
    /// With an idempotency key, a prior job with the same key wins: its id
    /// is returned and nothing is inserted. A concurrent duplicate that
    /// trips the unique index is treated the same way via a read-back.
    pub async fn enqueue(
        &self,
        name: &str,
        message: &Value,
        options: EnqueueOptions,
    ) -> Result<Enqueued> {
        let parsed = parse_queue_name(name)?;
        let queue_name = parsed.kind.job_queue_name(&self.job_prefix);

        if let Some(key) = &options.idempotency_key
            && let Some(existing) = self.storage.find_job_by_idempotency_key(key).await?
        {
            debug!(key = %key, message_id = %existing.id, "enqueue deduplicated");
            return Ok(Enqueued {
                message_id: existing.id,
            });
        }

        let message_id = ids::message_id();
        let payload = serde_json::to_value(MessageData {
            id: parsed.queue_id,
            data: message.clone(),
            attempt: 1,
            message_id: message_id.clone(),
            idempotency_key: options.idempotency_key.clone(),
        })?;

        let job = NewJob {
            id: message_id.clone(),
            queue_name: queue_name.clone(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_for: Utc::now(),
            idempotency_key: options.idempotency_key.clone(),
        };

        match self.storage.insert_job(&job).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                // Lost a same-key race; the unique index deduplicated for us.
                if let Some(key) = &options.idempotency_key
                    && let Some(existing) = self.storage.find_job_by_idempotency_key(key).await?
                {
                    return Ok(Enqueued {
                        message_id: existing.id,
                    });
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        self.notify_enqueued(&queue_name).await;

        Ok(Enqueued { message_id })
    }

    /// Start the worker loops: `concurrency` workers per queue family, plus
    /// the LISTEN nudger on PostgreSQL. Safe to call more than once.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut tasks = Vec::new();

        for kind in [QueueKind::Workflow, QueueKind::Step] {
            let queue_name = kind.job_queue_name(&self.job_prefix);
            for worker in 0..self.concurrency {
                let ctx = WorkerContext {
                    storage: self.storage.clone(),
                    executor: self.executor.clone(),
                    queue_name: queue_name.clone(),
                    kind,
                    nudge: self.nudge.clone(),
                    worker,
                };
                tasks.push(tokio::spawn(worker::run_worker(
                    ctx,
                    self.shutdown.subscribe(),
                )));
            }
        }

        if let Some(mut listener) = self.adapter.listener().await? {
            listener
                .listen(JOB_CHANNEL)
                .await
                .map_err(|e| WorldError::database("listen", e))?;
            let nudge = self.nudge.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }

                        notification = listener.recv() => match notification {
                            Ok(_) => nudge.notify_waiters(),
                            Err(e) => {
                                warn!(error = %e, "job LISTEN connection dropped, retrying");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }));
        }

        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(tasks);

        info!(
            job_prefix = %self.job_prefix,
            concurrency = self.concurrency,
            "job queue started"
        );
        Ok(())
    }

    /// Stop polling. Workers observe the signal at their next tick;
    /// in-flight handlers run to completion before the tasks exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.nudge.notify_waiters();

        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }

        info!(job_prefix = %self.job_prefix, "job queue stopped");
    }

    async fn notify_enqueued(&self, queue_name: &str) {
        if let Some(pool) = self.adapter.postgres_pool() {
            let result = sqlx::query("SELECT pg_notify($1, $2)")
                .bind(JOB_CHANNEL)
                .bind(queue_name)
                .execute(pool)
                .await;
            if let Err(e) = result {
                warn!(error = %e, queue = %queue_name, "enqueue NOTIFY failed");
            }
        }
    }
}
