// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MySQL-backed storage implementation.
//!
//! MySQL has no `RETURNING`, so every mutating operation that must hand
//! back the post-write row follows the DML with a primary-key SELECT. The
//! pair runs inside a transaction so concurrent writers cannot slip a
//! second mutation between them. UPDATE read-backs always key on the
//! primary key, never on the original WHERE clause, because that clause
//! may reference columns the update just changed. Duplicate-key errors on
//! conflict-ignoring inserts are swallowed and degraded to the read-back.

use chrono::{DateTime, Utc};
use sqlx::{Executor, MySql, MySqlPool};

use crate::auth::AuthContext;
use crate::error::{Result, WorldError};
use crate::ids;

use super::{
    ChunkRecord, EventRecord, HookRecord, JobRecord, ListEventsParams, ListRunsParams, NewEvent,
    NewHook, NewJob, NewRun, NewStep, Page, RunRecord, RunUpdate, SortOrder, StepRecord,
    StepUpdate, Storage, conflict_on_unique, paginate, plan_run_update, plan_step_update,
};

/// MySQL-backed storage.
#[derive(Clone)]
pub struct MySqlStorage {
    pool: MySqlPool,
}

impl MySqlStorage {
    /// Create a new MySQL storage over an existing pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

// Primary-key fetches shared by the pool paths and the transactional
// read-backs.

async fn fetch_run<'c, E>(executor: E, run_id: &str) -> Result<Option<RunRecord>>
where
    E: Executor<'c, Database = MySql>,
{
    let record = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT run_id, deployment_id, workflow_name, status, input, output,
               execution_context, error, error_code, created_at, updated_at,
               started_at, completed_at
        FROM workflow_runs
        WHERE run_id = ?
        "#,
    )
    .bind(run_id)
    .fetch_optional(executor)
    .await?;

    Ok(record)
}

async fn fetch_step<'c, E>(executor: E, step_id: &str) -> Result<Option<StepRecord>>
where
    E: Executor<'c, Database = MySql>,
{
    let record = sqlx::query_as::<_, StepRecord>(
        r#"
        SELECT step_id, run_id, step_name, status, input, output, error,
               error_code, attempt, created_at, updated_at, started_at, completed_at
        FROM workflow_steps
        WHERE step_id = ?
        "#,
    )
    .bind(step_id)
    .fetch_optional(executor)
    .await?;

    Ok(record)
}

async fn fetch_hook<'c, E>(executor: E, hook_id: &str) -> Result<Option<HookRecord>>
where
    E: Executor<'c, Database = MySql>,
{
    let record = sqlx::query_as::<_, HookRecord>(
        r#"
        SELECT hook_id, run_id, token, owner_id, project_id, environment,
               metadata, created_at
        FROM workflow_hooks
        WHERE hook_id = ?
        "#,
    )
    .bind(hook_id)
    .fetch_optional(executor)
    .await?;

    Ok(record)
}

async fn fetch_event<'c, E>(executor: E, event_id: &str) -> Result<Option<EventRecord>>
where
    E: Executor<'c, Database = MySql>,
{
    let record = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
        FROM workflow_events
        WHERE event_id = ?
        "#,
    )
    .bind(event_id)
    .fetch_optional(executor)
    .await?;

    Ok(record)
}

#[async_trait::async_trait]
impl Storage for MySqlStorage {
    // -- runs ----------------------------------------------------------------

    async fn create_run(&self, new: NewRun) -> Result<RunRecord> {
        let run_id = new.run_id.unwrap_or_else(ids::run_id);
        let now = Utc::now();

        // Pre-check so a duplicate surfaces as Conflict even though the
        // insert below would also trip the primary key.
        if fetch_run(&self.pool, &run_id).await?.is_some() {
            return Err(WorldError::conflict("run", &run_id));
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (run_id, deployment_id, workflow_name, status, input, execution_context,
                 created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(&new.deployment_id)
        .bind(&new.workflow_name)
        .bind(&new.input)
        .bind(&new.execution_context)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "run", &run_id))?;

        fetch_run(&self.pool, &run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", &run_id))
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        fetch_run(&self.pool, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<RunRecord> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE run_id = ?
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WorldError::not_found("run", run_id))?;

        let write = plan_run_update(&current, update, Utc::now());

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = ?, output = ?, execution_context = ?, error = ?,
                error_code = ?, started_at = ?, completed_at = ?, updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(&write.status)
        .bind(&write.output)
        .bind(&write.execution_context)
        .bind(&write.error)
        .bind(&write.error_code)
        .bind(write.started_at)
        .bind(write.completed_at)
        .bind(write.updated_at)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let record = fetch_run(&mut *tx, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;

        tx.commit().await?;
        Ok(record)
    }

    async fn cancel_run(&self, run_id: &str) -> Result<RunRecord> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // MySQL reports changed rows, not matched rows, so the affected
        // count cannot distinguish "missing" from "already cancelled"; the
        // read-back settles it.
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled', completed_at = COALESCE(completed_at, ?),
                updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let record = fetch_run(&mut *tx, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;

        tx.commit().await?;
        Ok(record)
    }

    async fn pause_run(&self, run_id: &str) -> Result<RunRecord> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE run_id = ? AND status = 'running'
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        if current.is_none() {
            return Err(WorldError::not_found("running run", run_id));
        }

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'paused', updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let record = fetch_run(&mut *tx, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;

        tx.commit().await?;
        Ok(record)
    }

    async fn resume_run(&self, run_id: &str) -> Result<RunRecord> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE run_id = ? AND status = 'paused'
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        if current.is_none() {
            return Err(WorldError::not_found("paused run", run_id));
        }

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'running', updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let record = fetch_run(&mut *tx, run_id)
            .await?
            .ok_or_else(|| WorldError::not_found("run", run_id))?;

        tx.commit().await?;
        Ok(record)
    }

    async fn list_runs(&self, params: ListRunsParams) -> Result<Page<RunRecord>> {
        let workflow_name = params.workflow_name.as_deref();
        let status = params.status.map(|s| s.as_str());
        let cursor = params.cursor.as_deref();

        let rows = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE (? IS NULL OR workflow_name = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR run_id < ?)
            ORDER BY run_id DESC
            LIMIT ?
            "#,
        )
        .bind(workflow_name)
        .bind(workflow_name)
        .bind(status)
        .bind(status)
        .bind(cursor)
        .bind(cursor)
        .bind(params.limit.max(1) + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(paginate(rows, params.limit, |run| run.run_id.clone()))
    }

    // -- steps ---------------------------------------------------------------

    async fn create_step(&self, new: NewStep) -> Result<StepRecord> {
        let step_id = new.step_id.unwrap_or_else(ids::step_id);
        let now = Utc::now();

        let insert = sqlx::query(
            r#"
            INSERT INTO workflow_steps
                (step_id, run_id, step_name, status, input, attempt, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(&step_id)
        .bind(&new.run_id)
        .bind(&new.step_name)
        .bind(&new.input)
        .bind(new.attempt)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        // Creation is idempotent by step_id: a duplicate key (driver error
        // 1062) falls through to the read-back.
        if let Err(e) = insert {
            match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {}
                _ => return Err(e.into()),
            }
        }

        fetch_step(&self.pool, &step_id)
            .await?
            .ok_or_else(|| WorldError::conflict("step", &step_id))
    }

    async fn get_step(&self, step_id: &str) -> Result<StepRecord> {
        fetch_step(&self.pool, step_id)
            .await?
            .ok_or_else(|| WorldError::not_found("step", step_id))
    }

    async fn update_step(&self, step_id: &str, update: StepUpdate) -> Result<StepRecord> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT step_id, run_id, step_name, status, input, output, error,
                   error_code, attempt, created_at, updated_at, started_at, completed_at
            FROM workflow_steps
            WHERE step_id = ?
            FOR UPDATE
            "#,
        )
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WorldError::not_found("step", step_id))?;

        let write = plan_step_update(&current, update, Utc::now());

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?, output = ?, error = ?, error_code = ?,
                started_at = ?, completed_at = ?, updated_at = ?
            WHERE step_id = ?
            "#,
        )
        .bind(&write.status)
        .bind(&write.output)
        .bind(&write.error)
        .bind(&write.error_code)
        .bind(write.started_at)
        .bind(write.completed_at)
        .bind(write.updated_at)
        .bind(step_id)
        .execute(&mut *tx)
        .await?;

        let record = fetch_step(&mut *tx, step_id)
            .await?
            .ok_or_else(|| WorldError::not_found("step", step_id))?;

        tx.commit().await?;
        Ok(record)
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let records = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT step_id, run_id, step_name, status, input, output, error,
                   error_code, attempt, created_at, updated_at, started_at, completed_at
            FROM workflow_steps
            WHERE run_id = ?
            ORDER BY step_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // -- events --------------------------------------------------------------

    async fn create_event(&self, new: NewEvent) -> Result<EventRecord> {
        let event_id = ids::event_id();

        sqlx::query(
            r#"
            INSERT INTO workflow_events
                (event_id, run_id, event_type, correlation_id, event_data, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event_id)
        .bind(&new.run_id)
        .bind(&new.event_type)
        .bind(&new.correlation_id)
        .bind(&new.event_data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "event", &event_id))?;

        fetch_event(&self.pool, &event_id)
            .await?
            .ok_or_else(|| WorldError::not_found("event", &event_id))
    }

    async fn list_events(
        &self,
        run_id: &str,
        params: ListEventsParams,
    ) -> Result<Page<EventRecord>> {
        let sql = match params.sort_order {
            SortOrder::Asc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE run_id = ? AND (? IS NULL OR event_id > ?)
                ORDER BY event_id ASC
                LIMIT ?
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE run_id = ? AND (? IS NULL OR event_id < ?)
                ORDER BY event_id DESC
                LIMIT ?
                "#
            }
        };

        let cursor = params.cursor.as_deref();
        let rows = sqlx::query_as::<_, EventRecord>(sql)
            .bind(run_id)
            .bind(cursor)
            .bind(cursor)
            .bind(params.limit.max(1) + 1)
            .fetch_all(&self.pool)
            .await?;

        Ok(paginate(rows, params.limit, |event| event.event_id.clone()))
    }

    async fn list_events_by_correlation(
        &self,
        correlation_id: &str,
        params: ListEventsParams,
    ) -> Result<Page<EventRecord>> {
        let sql = match params.sort_order {
            SortOrder::Asc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE correlation_id = ? AND (? IS NULL OR event_id > ?)
                ORDER BY event_id ASC
                LIMIT ?
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE correlation_id = ? AND (? IS NULL OR event_id < ?)
                ORDER BY event_id DESC
                LIMIT ?
                "#
            }
        };

        let cursor = params.cursor.as_deref();
        let rows = sqlx::query_as::<_, EventRecord>(sql)
            .bind(correlation_id)
            .bind(cursor)
            .bind(cursor)
            .bind(params.limit.max(1) + 1)
            .fetch_all(&self.pool)
            .await?;

        Ok(paginate(rows, params.limit, |event| event.event_id.clone()))
    }

    // -- hooks ---------------------------------------------------------------

    async fn create_hook(&self, new: NewHook, auth: &AuthContext) -> Result<HookRecord> {
        let hook_id = new.hook_id.unwrap_or_else(ids::hook_id);

        sqlx::query(
            r#"
            INSERT INTO workflow_hooks
                (hook_id, run_id, token, owner_id, project_id, environment, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&hook_id)
        .bind(&new.run_id)
        .bind(&new.token)
        .bind(&auth.owner_id)
        .bind(&auth.project_id)
        .bind(&auth.environment)
        .bind(&new.metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "hook", &hook_id))?;

        fetch_hook(&self.pool, &hook_id)
            .await?
            .ok_or_else(|| WorldError::not_found("hook", &hook_id))
    }

    async fn get_hook_by_token(&self, token: &str) -> Result<HookRecord> {
        let record = sqlx::query_as::<_, HookRecord>(
            r#"
            SELECT hook_id, run_id, token, owner_id, project_id, environment,
                   metadata, created_at
            FROM workflow_hooks
            WHERE token = ?
            ORDER BY hook_id ASC
            LIMIT 1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("hook", token))
    }

    async fn list_hooks(&self, run_id: &str) -> Result<Vec<HookRecord>> {
        let records = sqlx::query_as::<_, HookRecord>(
            r#"
            SELECT hook_id, run_id, token, owner_id, project_id, environment,
                   metadata, created_at
            FROM workflow_hooks
            WHERE run_id = ?
            ORDER BY hook_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn dispose_hook(&self, hook_id: &str) -> Result<HookRecord> {
        // SELECT-then-DELETE in one transaction approximates the atomic
        // DELETE RETURNING of the other back-ends.
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, HookRecord>(
            r#"
            SELECT hook_id, run_id, token, owner_id, project_id, environment,
                   metadata, created_at
            FROM workflow_hooks
            WHERE hook_id = ?
            FOR UPDATE
            "#,
        )
        .bind(hook_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| WorldError::not_found("hook", hook_id))?;

        sqlx::query("DELETE FROM workflow_hooks WHERE hook_id = ?")
            .bind(hook_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    // -- stream chunks -------------------------------------------------------

    async fn append_chunk(
        &self,
        stream_id: &str,
        chunk_id: &str,
        data: &[u8],
        eof: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_stream_chunks (stream_id, chunk_id, chunk_data, eof, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(stream_id)
        .bind(chunk_id)
        .bind(data)
        .bind(eof)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_chunks(&self, stream_id: &str) -> Result<Vec<ChunkRecord>> {
        let records = sqlx::query_as::<_, ChunkRecord>(
            r#"
            SELECT stream_id, chunk_id, chunk_data, eof, created_at
            FROM workflow_stream_chunks
            WHERE stream_id = ?
            ORDER BY chunk_id ASC
            "#,
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn chunks_after(
        &self,
        stream_id: &str,
        last_chunk_id: &str,
        limit: i64,
    ) -> Result<Vec<ChunkRecord>> {
        let records = sqlx::query_as::<_, ChunkRecord>(
            r#"
            SELECT stream_id, chunk_id, chunk_data, eof, created_at
            FROM workflow_stream_chunks
            WHERE stream_id = ? AND chunk_id > ?
            ORDER BY chunk_id ASC
            LIMIT ?
            "#,
        )
        .bind(stream_id)
        .bind(last_chunk_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get_chunk(&self, stream_id: &str, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let record = sqlx::query_as::<_, ChunkRecord>(
            r#"
            SELECT stream_id, chunk_id, chunk_data, eof, created_at
            FROM workflow_stream_chunks
            WHERE stream_id = ? AND chunk_id = ?
            "#,
        )
        .bind(stream_id)
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    // -- jobs ----------------------------------------------------------------

    async fn insert_job(&self, job: &NewJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_jobs
                (id, queue_name, payload, status, attempts, max_attempts,
                 scheduled_for, idempotency_key, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue_name)
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.scheduled_for)
        .bind(&job.idempotency_key)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "job", &job.id))?;

        Ok(())
    }

    async fn find_job_by_idempotency_key(&self, key: &str) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, queue_name, payload, status, attempts, max_attempts,
                   locked_until, scheduled_for, idempotency_key, error,
                   created_at, updated_at
            FROM workflow_jobs
            WHERE idempotency_key = ?
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn due_jobs(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, queue_name, payload, status, attempts, max_attempts,
                   locked_until, scheduled_for, idempotency_key, error,
                   created_at, updated_at
            FROM workflow_jobs
            WHERE queue_name = ?
              AND scheduled_for <= ?
              AND (
                  (status = 'pending' AND (locked_until IS NULL OR locked_until <= ?))
                  OR (status = 'processing' AND locked_until <= ?)
              )
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn try_lease_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'processing', locked_until = ?, attempts = attempts + 1,
                updated_at = ?
            WHERE id = ?
              AND (
                  (status = 'pending' AND (locked_until IS NULL OR locked_until <= ?))
                  OR (status = 'processing' AND locked_until <= ?)
              )
            "#,
        )
        .bind(locked_until)
        .bind(now)
        .bind(job_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'completed', locked_until = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retry_job(
        &self,
        job_id: &str,
        scheduled_for: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'pending', locked_until = NULL, scheduled_for = ?,
                error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(scheduled_for)
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_job(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'failed', locked_until = NULL, error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, queue_name, payload, status, attempts, max_attempts,
                   locked_until, scheduled_for, idempotency_key, error,
                   created_at, updated_at
            FROM workflow_jobs
            WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
