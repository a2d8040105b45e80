// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed storage implementation.
//!
//! PostgreSQL supports atomic `RETURNING`, so every mutating statement
//! returns the post-write row in a single round trip.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::auth::AuthContext;
use crate::error::{Result, WorldError};
use crate::ids;

use super::{
    ChunkRecord, EventRecord, HookRecord, JobRecord, ListEventsParams, ListRunsParams, NewEvent,
    NewHook, NewJob, NewRun, NewStep, Page, RunRecord, RunUpdate, SortOrder, StepRecord,
    StepUpdate, Storage, conflict_on_unique, paginate, plan_run_update, plan_step_update,
};

/// PostgreSQL-backed storage.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a new PostgreSQL storage over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Storage for PostgresStorage {
    // -- runs ----------------------------------------------------------------

    async fn create_run(&self, new: NewRun) -> Result<RunRecord> {
        let run_id = new.run_id.unwrap_or_else(ids::run_id);
        let now = Utc::now();

        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            INSERT INTO workflow_runs
                (run_id, deployment_id, workflow_name, status, input, execution_context,
                 created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $6)
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(&run_id)
        .bind(&new.deployment_id)
        .bind(&new.workflow_name)
        .bind(&new.input)
        .bind(&new.execution_context)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "run", &run_id))?;

        Ok(record)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("run", run_id))
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<RunRecord> {
        let current = self.get_run(run_id).await?;
        let write = plan_run_update(&current, update, Utc::now());

        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            UPDATE workflow_runs
            SET status = $2, output = $3, execution_context = $4, error = $5,
                error_code = $6, started_at = $7, completed_at = $8, updated_at = $9
            WHERE run_id = $1
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(&write.status)
        .bind(&write.output)
        .bind(&write.execution_context)
        .bind(&write.error)
        .bind(&write.error_code)
        .bind(write.started_at)
        .bind(write.completed_at)
        .bind(write.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("run", run_id))
    }

    async fn cancel_run(&self, run_id: &str) -> Result<RunRecord> {
        let now = Utc::now();

        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled', completed_at = COALESCE(completed_at, $2),
                updated_at = $2
            WHERE run_id = $1
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("run", run_id))
    }

    async fn pause_run(&self, run_id: &str) -> Result<RunRecord> {
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            UPDATE workflow_runs
            SET status = 'paused', updated_at = $2
            WHERE run_id = $1 AND status = 'running'
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("running run", run_id))
    }

    async fn resume_run(&self, run_id: &str) -> Result<RunRecord> {
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            UPDATE workflow_runs
            SET status = 'running', updated_at = $2
            WHERE run_id = $1 AND status = 'paused'
            RETURNING run_id, deployment_id, workflow_name, status, input, output,
                      execution_context, error, error_code, created_at, updated_at,
                      started_at, completed_at
            "#,
        )
        .bind(run_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("paused run", run_id))
    }

    async fn list_runs(&self, params: ListRunsParams) -> Result<Page<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, deployment_id, workflow_name, status, input, output,
                   execution_context, error, error_code, created_at, updated_at,
                   started_at, completed_at
            FROM workflow_runs
            WHERE ($1::TEXT IS NULL OR workflow_name = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR run_id < $3)
            ORDER BY run_id DESC
            LIMIT $4
            "#,
        )
        .bind(&params.workflow_name)
        .bind(params.status.map(|s| s.as_str()))
        .bind(&params.cursor)
        .bind(params.limit.max(1) + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(paginate(rows, params.limit, |run| run.run_id.clone()))
    }

    // -- steps ---------------------------------------------------------------

    async fn create_step(&self, new: NewStep) -> Result<StepRecord> {
        let step_id = new.step_id.unwrap_or_else(ids::step_id);
        let now = Utc::now();

        let inserted = sqlx::query_as::<_, StepRecord>(
            r#"
            INSERT INTO workflow_steps
                (step_id, run_id, step_name, status, input, attempt, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $6)
            ON CONFLICT (step_id) DO NOTHING
            RETURNING step_id, run_id, step_name, status, input, output, error,
                      error_code, attempt, created_at, updated_at, started_at, completed_at
            "#,
        )
        .bind(&step_id)
        .bind(&new.run_id)
        .bind(&new.step_name)
        .bind(&new.input)
        .bind(new.attempt)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok(record);
        }

        // The insert conflicted; hand back the row that won.
        match self.get_step(&step_id).await {
            Ok(record) => Ok(record),
            Err(e) if e.is_not_found() => Err(WorldError::conflict("step", &step_id)),
            Err(e) => Err(e),
        }
    }

    async fn get_step(&self, step_id: &str) -> Result<StepRecord> {
        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT step_id, run_id, step_name, status, input, output, error,
                   error_code, attempt, created_at, updated_at, started_at, completed_at
            FROM workflow_steps
            WHERE step_id = $1
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("step", step_id))
    }

    async fn update_step(&self, step_id: &str, update: StepUpdate) -> Result<StepRecord> {
        let current = self.get_step(step_id).await?;
        let write = plan_step_update(&current, update, Utc::now());

        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            UPDATE workflow_steps
            SET status = $2, output = $3, error = $4, error_code = $5,
                started_at = $6, completed_at = $7, updated_at = $8
            WHERE step_id = $1
            RETURNING step_id, run_id, step_name, status, input, output, error,
                      error_code, attempt, created_at, updated_at, started_at, completed_at
            "#,
        )
        .bind(step_id)
        .bind(&write.status)
        .bind(&write.output)
        .bind(&write.error)
        .bind(&write.error_code)
        .bind(write.started_at)
        .bind(write.completed_at)
        .bind(write.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("step", step_id))
    }

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let records = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT step_id, run_id, step_name, status, input, output, error,
                   error_code, attempt, created_at, updated_at, started_at, completed_at
            FROM workflow_steps
            WHERE run_id = $1
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

        let record = sqlx::query_as::<_, EventRecord>(
            r#"
            INSERT INTO workflow_events
                (event_id, run_id, event_type, correlation_id, event_data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING event_id, run_id, event_type, correlation_id, event_data, created_at
            "#,
        )
        .bind(&event_id)
        .bind(&new.run_id)
        .bind(&new.event_type)
        .bind(&new.correlation_id)
        .bind(&new.event_data)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, "event", &event_id))?;

        Ok(record)
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
                WHERE run_id = $1 AND ($2::TEXT IS NULL OR event_id > $2)
                ORDER BY event_id ASC
                LIMIT $3
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE run_id = $1 AND ($2::TEXT IS NULL OR event_id < $2)
                ORDER BY event_id DESC
                LIMIT $3
                "#
            }
        };

        let rows = sqlx::query_as::<_, EventRecord>(sql)
            .bind(run_id)
            .bind(&params.cursor)
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
                WHERE correlation_id = $1 AND ($2::TEXT IS NULL OR event_id > $2)
                ORDER BY event_id ASC
                LIMIT $3
                "#
            }
            SortOrder::Desc => {
                r#"
                SELECT event_id, run_id, event_type, correlation_id, event_data, created_at
                FROM workflow_events
                WHERE correlation_id = $1 AND ($2::TEXT IS NULL OR event_id < $2)
                ORDER BY event_id DESC
                LIMIT $3
                "#
            }
        };

        let rows = sqlx::query_as::<_, EventRecord>(sql)
            .bind(correlation_id)
            .bind(&params.cursor)
            .bind(params.limit.max(1) + 1)
            .fetch_all(&self.pool)
            .await?;

        Ok(paginate(rows, params.limit, |event| event.event_id.clone()))
    }

    // -- hooks ---------------------------------------------------------------

    async fn create_hook(&self, new: NewHook, auth: &AuthContext) -> Result<HookRecord> {
        let hook_id = new.hook_id.unwrap_or_else(ids::hook_id);

        let record = sqlx::query_as::<_, HookRecord>(
            r#"
            INSERT INTO workflow_hooks
                (hook_id, run_id, token, owner_id, project_id, environment, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (hook_id) DO NOTHING
            RETURNING hook_id, run_id, token, owner_id, project_id, environment,
                      metadata, created_at
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
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::conflict("hook", &hook_id))
    }

    async fn get_hook_by_token(&self, token: &str) -> Result<HookRecord> {
        let record = sqlx::query_as::<_, HookRecord>(
            r#"
            SELECT hook_id, run_id, token, owner_id, project_id, environment,
                   metadata, created_at
            FROM workflow_hooks
            WHERE token = $1
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
            WHERE run_id = $1
            ORDER BY hook_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn dispose_hook(&self, hook_id: &str) -> Result<HookRecord> {
        let record = sqlx::query_as::<_, HookRecord>(
            r#"
            DELETE FROM workflow_hooks
            WHERE hook_id = $1
            RETURNING hook_id, run_id, token, owner_id, project_id, environment,
                      metadata, created_at
            "#,
        )
        .bind(hook_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| WorldError::not_found("hook", hook_id))
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
            VALUES ($1, $2, $3, $4, $5)
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
            WHERE stream_id = $1
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
            WHERE stream_id = $1 AND chunk_id > $2
            ORDER BY chunk_id ASC
            LIMIT $3
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
            WHERE stream_id = $1 AND chunk_id = $2
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
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $7, $7)
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue_name)
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.scheduled_for)
        .bind(&job.idempotency_key)
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
            WHERE idempotency_key = $1
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
            WHERE queue_name = $1
              AND scheduled_for <= $2
              AND (
                  (status = 'pending' AND (locked_until IS NULL OR locked_until <= $2))
                  OR (status = 'processing' AND locked_until <= $2)
              )
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(queue_name)
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
            SET status = 'processing', locked_until = $3, attempts = attempts + 1,
                updated_at = $2
            WHERE id = $1
              AND (
                  (status = 'pending' AND (locked_until IS NULL OR locked_until <= $2))
                  OR (status = 'processing' AND locked_until <= $2)
              )
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(locked_until)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'completed', locked_until = NULL, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
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
            SET status = 'pending', locked_until = NULL, scheduled_for = $2,
                error = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(scheduled_for)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_job(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'failed', locked_until = NULL, error = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(Utc::now())
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
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
