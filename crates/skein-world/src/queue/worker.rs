// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leased polling workers.
//!
//! Each worker ticks every 200 ms (or sooner on a nudge), pulls up to ten
//! due jobs in primary-key order and races the other workers for a
//! conditional lease. A lease lasts 30 seconds; a worker that dies holding
//! one simply lets it expire, after which any worker may steal the job.
//! That is the crash-recovery path and what makes delivery at-least-once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::executor::Executor;
use crate::storage::{JobRecord, Storage};

use super::{MessageData, QueueKind, retry_backoff};

/// Poll cadence per worker.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Candidate batch size per poll.
pub(crate) const BATCH_SIZE: i64 = 10;

/// Lease duration; doubles as the de-facto handler timeout.
pub(crate) const LEASE_SECONDS: i64 = 30;

/// Everything a worker loop needs.
pub(crate) struct WorkerContext {
    pub storage: Arc<dyn Storage>,
    pub executor: Arc<dyn Executor>,
    pub queue_name: String,
    pub kind: QueueKind,
    pub nudge: Arc<Notify>,
    pub worker: usize,
}

/// One worker loop. Exits when the shutdown flag flips; an in-flight
/// handler always runs to completion first.
pub(crate) async fn run_worker(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    debug!(queue = %ctx.queue_name, worker = ctx.worker, "queue worker started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ctx.nudge.notified() => {}

            _ = sleep(POLL_INTERVAL) => {}
        }

        if *shutdown.borrow() {
            break;
        }

        poll_once(&ctx, &shutdown).await;
    }

    debug!(queue = %ctx.queue_name, worker = ctx.worker, "queue worker stopped");
}

async fn poll_once(ctx: &WorkerContext, shutdown: &watch::Receiver<bool>) {
    let batch = match ctx
        .storage
        .due_jobs(&ctx.queue_name, Utc::now(), BATCH_SIZE)
        .await
    {
        Ok(batch) => batch,
        Err(e) => {
            warn!(queue = %ctx.queue_name, error = %e, "job poll failed");
            return;
        }
    };

    for job in batch {
        if *shutdown.borrow() {
            return;
        }

        let now = Utc::now();
        let locked_until = now + chrono::Duration::seconds(LEASE_SECONDS);
        match ctx.storage.try_lease_job(&job.id, now, locked_until).await {
            Ok(true) => process_job(ctx, job).await,
            Ok(false) => {
                // Another worker won the lease race.
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "job lease failed");
            }
        }
    }
}

/// Decode and dispatch a leased job, then settle its row.
async fn process_job(ctx: &WorkerContext, job: JobRecord) {
    // `attempts` was read before the lease incremented it.
    let attempt = job.attempts + 1;

    let mut message: MessageData = match serde_json::from_value(job.payload.clone()) {
        Ok(message) => message,
        Err(e) => {
            // An undecodable payload can never succeed; skip the retry ladder.
            error!(job_id = %job.id, error = %e, "job payload failed to decode");
            if let Err(e) = ctx
                .storage
                .fail_job(&job.id, &format!("payload decode failed: {e}"))
                .await
            {
                warn!(job_id = %job.id, error = %e, "failed to mark job failed");
            }
            return;
        }
    };
    message.attempt = attempt.max(1) as u32;

    let inner_queue = format!("{}{}", ctx.kind.caller_prefix(), message.id);

    match ctx.executor.execute(&inner_queue, message).await {
        Ok(_) => {
            debug!(job_id = %job.id, queue = %inner_queue, attempt, "job completed");
            if let Err(e) = ctx.storage.complete_job(&job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to mark job completed");
            }
        }
        Err(e) => {
            let error_text = format!("{e:#}");
            if attempt < job.max_attempts {
                let delay = retry_backoff(attempt);
                let scheduled_for = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                debug!(
                    job_id = %job.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error_text,
                    "job failed, scheduling retry"
                );
                if let Err(e) = ctx
                    .storage
                    .retry_job(&job.id, scheduled_for, &error_text)
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "failed to schedule retry");
                }
            } else {
                warn!(
                    job_id = %job.id,
                    attempt,
                    error = %error_text,
                    "job exhausted its attempts"
                );
                if let Err(e) = ctx.storage.fail_job(&job.id, &error_text).await {
                    warn!(job_id = %job.id, error = %e, "failed to mark job failed");
                }
            }
        }
    }
}
