// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage interfaces and back-ends for the workflow world.
//!
//! One [`Storage`] trait covers the five persistent entities (runs, steps,
//! events, hooks, stream chunks) plus the embedded job table. Back-ends
//! are picked at construction; method calls are monomorphic afterwards.
//!
//! PostgreSQL and SQLite return mutated rows atomically with `RETURNING`;
//! MySQL emulates that with DML followed by a primary-key SELECT inside a
//! transaction (see [`mysql`]).

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use self::mysql::MySqlStorage;
pub use self::postgres::PostgresStorage;
pub use self::sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::auth::AuthContext;
use crate::error::Result;

/// Default page size for list operations.
pub const DEFAULT_LIST_LIMIT: i64 = 20;

// ============================================================================
// Statuses
// ============================================================================

/// Run lifecycle states.
///
/// ```text
/// pending ──► running ◄──► paused
///                │
///                ├──► completed
///                ├──► failed
///                └──► cancelled      (cancel is accepted from any
///                                     non-terminal state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Created, not yet picked up.
    Pending,
    /// Actively executing.
    Running,
    /// Suspended; resumable.
    Paused,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with an error. Terminal.
    Failed,
    /// Cancelled by a caller. Terminal.
    Cancelled,
}

impl RunStatus {
    /// Canonical lowercase name, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status string.
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Step attempt states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Created, not yet started.
    Pending,
    /// Actively executing.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished with an error. Terminal.
    Failed,
}

impl StepStatus {
    /// Canonical lowercase name, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored status string.
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Queue job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting to be leased.
    Pending,
    /// Leased by a worker; `locked_until` bounds the lease.
    Processing,
    /// Handler succeeded. Terminal.
    Completed,
    /// Attempts exhausted. Terminal.
    Failed,
}

impl JobStatus {
    /// Canonical lowercase name, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A workflow run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Primary key, `wrun_<ulid>`.
    pub run_id: String,
    /// Deployment the run belongs to.
    pub deployment_id: String,
    /// Name of the workflow being executed.
    pub workflow_name: String,
    /// Current lifecycle state.
    pub status: String,
    /// Workflow arguments (JSON array).
    pub input: Value,
    /// Workflow result, once completed.
    pub output: Option<Value>,
    /// Engine-private execution context.
    pub execution_context: Option<Value>,
    /// Error message from a failed run.
    pub error: Option<String>,
    /// Machine-readable error code.
    pub error_code: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// First transition to running; set exactly once.
    pub started_at: Option<DateTime<Utc>>,
    /// First transition to a terminal state; never cleared.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A step attempt row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepRecord {
    /// Primary key, `wstp_<ulid>`.
    pub step_id: String,
    /// Run this attempt belongs to.
    pub run_id: String,
    /// Step name inside the workflow.
    pub step_name: String,
    /// Current attempt state.
    pub status: String,
    /// Step arguments.
    pub input: Value,
    /// Step result, once completed.
    pub output: Option<Value>,
    /// Error message from a failed attempt.
    pub error: Option<String>,
    /// Machine-readable error code.
    pub error_code: Option<String>,
    /// Attempt number, 1-based.
    pub attempt: i32,
    /// When the attempt was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// First transition to running; set exactly once.
    pub started_at: Option<DateTime<Utc>>,
    /// First transition to completed/failed; never cleared.
    pub completed_at: Option<DateTime<Utc>>,
}

/// An append-only event row used for deterministic replay.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRecord {
    /// Primary key, `wevt_<ulid>`.
    pub event_id: String,
    /// Run the event belongs to.
    pub run_id: String,
    /// Event type tag.
    pub event_type: String,
    /// Optional correlation key for cross-run queries.
    pub correlation_id: Option<String>,
    /// Event payload.
    pub event_data: Value,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// An external-callback registration row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HookRecord {
    /// Primary key, `whook_<ulid>`.
    pub hook_id: String,
    /// Run the hook belongs to.
    pub run_id: String,
    /// Opaque lookup token; indexed.
    pub token: String,
    /// Owning account, from the resolved identity.
    pub owner_id: String,
    /// Project, from the resolved identity.
    pub project_id: String,
    /// Environment, from the resolved identity.
    pub environment: String,
    /// Caller-provided metadata.
    pub metadata: Value,
    /// When the hook was registered.
    pub created_at: DateTime<Utc>,
}

/// One segment of a byte stream.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkRecord {
    /// Stream this chunk belongs to (composite key, first part).
    pub stream_id: String,
    /// Chunk identifier, `chnk_<ulid>` (composite key, second part;
    /// ascending order is delivery order).
    pub chunk_id: String,
    /// Chunk bytes; empty for the EOF marker.
    pub chunk_data: Vec<u8>,
    /// End-of-stream marker.
    pub eof: bool,
    /// When the chunk was written.
    pub created_at: DateTime<Utc>,
}

/// A queued job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Primary key, `msg_<ulid>`.
    pub id: String,
    /// Job-queue name the job was enqueued on.
    pub queue_name: String,
    /// JSON-encoded message payload.
    pub payload: Value,
    /// Current job state.
    pub status: String,
    /// Lease attempts so far.
    pub attempts: i32,
    /// Attempts before the job is marked failed.
    pub max_attempts: i32,
    /// Lease expiry; a `processing` job past this is stealable.
    pub locked_until: Option<DateTime<Utc>>,
    /// Earliest time the job may be leased.
    pub scheduled_for: DateTime<Utc>,
    /// Deduplication key, unique when present.
    pub idempotency_key: Option<String>,
    /// Error text from the most recent failed attempt.
    pub error: Option<String>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Write shapes
// ============================================================================

/// Fields for creating a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Explicit run id; generated when `None`.
    pub run_id: Option<String>,
    /// Deployment the run belongs to.
    pub deployment_id: String,
    /// Name of the workflow to execute.
    pub workflow_name: String,
    /// Workflow arguments (JSON array).
    pub input: Value,
    /// Engine-private execution context.
    pub execution_context: Option<Value>,
}

/// Patch applied by [`Storage::update_run`]. `None` fields keep the current
/// value.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    /// New lifecycle state.
    pub status: Option<RunStatus>,
    /// Workflow result.
    pub output: Option<Value>,
    /// Engine-private execution context.
    pub execution_context: Option<Value>,
    /// Error message.
    pub error: Option<String>,
    /// Machine-readable error code.
    pub error_code: Option<String>,
}

/// Fields for creating a step attempt.
#[derive(Debug, Clone)]
pub struct NewStep {
    /// Explicit step id; generated when `None`. Creation is idempotent by
    /// this id.
    pub step_id: Option<String>,
    /// Run this attempt belongs to.
    pub run_id: String,
    /// Step name inside the workflow.
    pub step_name: String,
    /// Step arguments.
    pub input: Value,
    /// Attempt number, 1-based.
    pub attempt: i32,
}

/// Patch applied by [`Storage::update_step`]. `None` fields keep the
/// current value.
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    /// New attempt state.
    pub status: Option<StepStatus>,
    /// Step result.
    pub output: Option<Value>,
    /// Error message.
    pub error: Option<String>,
    /// Machine-readable error code.
    pub error_code: Option<String>,
}

/// Fields for appending an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Run the event belongs to.
    pub run_id: String,
    /// Event type tag.
    pub event_type: String,
    /// Optional correlation key.
    pub correlation_id: Option<String>,
    /// Event payload.
    pub event_data: Value,
}

/// Fields for registering a hook. The tenant identity comes from the
/// injected [`AuthContext`].
#[derive(Debug, Clone)]
pub struct NewHook {
    /// Explicit hook id; generated when `None`.
    pub hook_id: Option<String>,
    /// Run the hook belongs to.
    pub run_id: String,
    /// Opaque lookup token.
    pub token: String,
    /// Caller-provided metadata.
    pub metadata: Value,
}

/// Fields for inserting a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job id, `msg_<ulid>`.
    pub id: String,
    /// Job-queue name.
    pub queue_name: String,
    /// JSON-encoded message payload.
    pub payload: Value,
    /// Attempts before the job is marked failed.
    pub max_attempts: i32,
    /// Earliest time the job may be leased.
    pub scheduled_for: DateTime<Utc>,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
}

// ============================================================================
// Listing
// ============================================================================

/// Sort direction for event listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first (the default for events).
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

/// Parameters for [`Storage::list_runs`]. Runs are returned newest first,
/// keyed on the time-prefixed `run_id`.
#[derive(Debug, Clone)]
pub struct ListRunsParams {
    /// Only runs of this workflow.
    pub workflow_name: Option<String>,
    /// Only runs in this state.
    pub status: Option<RunStatus>,
    /// Page size.
    pub limit: i64,
    /// `run_id` of the last item from the previous page.
    pub cursor: Option<String>,
}

impl Default for ListRunsParams {
    fn default() -> Self {
        Self {
            workflow_name: None,
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            cursor: None,
        }
    }
}

/// Parameters for event listings.
#[derive(Debug, Clone)]
pub struct ListEventsParams {
    /// Page size.
    pub limit: i64,
    /// `event_id` of the last item from the previous page.
    pub cursor: Option<String>,
    /// Sort direction; ascending by default.
    pub sort_order: SortOrder,
}

impl Default for ListEventsParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            cursor: None,
            sort_order: SortOrder::Asc,
        }
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The items, at most `limit` of them.
    pub items: Vec<T>,
    /// Cursor for the next page; the primary key of the last item.
    pub cursor: Option<String>,
    /// Whether more items exist past this page.
    pub has_more: bool,
}

/// Assemble a page from rows fetched with `limit + 1`.
pub(crate) fn paginate<T>(
    mut rows: Vec<T>,
    limit: i64,
    cursor_of: impl Fn(&T) -> String,
) -> Page<T> {
    let limit = limit.max(1) as usize;
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let cursor = rows.last().map(cursor_of);
    Page {
        items: rows,
        cursor,
        has_more,
    }
}

/// Fold a driver error into `Conflict` when it is a unique-key violation,
/// passing everything else through unchanged.
pub(crate) fn conflict_on_unique(
    err: sqlx::Error,
    entity: &'static str,
    id: &str,
) -> crate::error::WorldError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            crate::error::WorldError::conflict(entity, id)
        }
        _ => err.into(),
    }
}

// ============================================================================
// Transition stamping
// ============================================================================

/// Computed column values for a run update. Produced by [`plan_run_update`]
/// from the current row so every back-end applies identical stamping rules.
#[derive(Debug, Clone)]
pub(crate) struct RunWrite {
    pub status: String,
    pub output: Option<Value>,
    pub execution_context: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Merge a patch into the current run row.
///
/// `started_at` is stamped on the first transition to running and then
/// carried forward untouched; `completed_at` is stamped on the first
/// transition to a terminal state and never cleared.
pub(crate) fn plan_run_update(current: &RunRecord, update: RunUpdate, now: DateTime<Utc>) -> RunWrite {
    let started_at = current.started_at.or_else(|| {
        (update.status == Some(RunStatus::Running)).then_some(now)
    });
    let completed_at = current.completed_at.or_else(|| {
        update
            .status
            .is_some_and(|next| next.is_terminal())
            .then_some(now)
    });

    RunWrite {
        status: update
            .status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| current.status.clone()),
        output: update.output.or_else(|| current.output.clone()),
        execution_context: update
            .execution_context
            .or_else(|| current.execution_context.clone()),
        error: update.error.or_else(|| current.error.clone()),
        error_code: update.error_code.or_else(|| current.error_code.clone()),
        started_at,
        completed_at,
        updated_at: now,
    }
}

/// Computed column values for a step update; same stamping rules as runs.
#[derive(Debug, Clone)]
pub(crate) struct StepWrite {
    pub status: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Merge a patch into the current step row.
pub(crate) fn plan_step_update(
    current: &StepRecord,
    update: StepUpdate,
    now: DateTime<Utc>,
) -> StepWrite {
    let started_at = current.started_at.or_else(|| {
        (update.status == Some(StepStatus::Running)).then_some(now)
    });
    let completed_at = current.completed_at.or_else(|| {
        update
            .status
            .is_some_and(|next| next.is_terminal())
            .then_some(now)
    });

    StepWrite {
        status: update
            .status
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| current.status.clone()),
        output: update.output.or_else(|| current.output.clone()),
        error: update.error.or_else(|| current.error.clone()),
        error_code: update.error_code.or_else(|| current.error_code.clone()),
        started_at,
        completed_at,
        updated_at: now,
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Durable CRUD over the five entities and the job table.
///
/// Every write that returns a row returns the post-write state. Missing
/// rows surface as `NotFound`, duplicate primary keys on create as
/// `Conflict`; other driver errors pass through unchanged. Storage never
/// retries internally.
#[allow(missing_docs)]
#[async_trait]
pub trait Storage: Send + Sync {
    // -- runs ----------------------------------------------------------------

    async fn create_run(&self, new: NewRun) -> Result<RunRecord>;

    async fn get_run(&self, run_id: &str) -> Result<RunRecord>;

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<RunRecord>;

    /// Cancel from any non-terminal state; terminal stamps are preserved.
    async fn cancel_run(&self, run_id: &str) -> Result<RunRecord>;

    /// Pause a running run.
    async fn pause_run(&self, run_id: &str) -> Result<RunRecord>;

    /// Resume a paused run; anything else is "paused run not found".
    async fn resume_run(&self, run_id: &str) -> Result<RunRecord>;

    async fn list_runs(&self, params: ListRunsParams) -> Result<Page<RunRecord>>;

    // -- steps ---------------------------------------------------------------

    /// Idempotent by `step_id`: a conflicting insert is ignored and the
    /// existing row returned.
    async fn create_step(&self, new: NewStep) -> Result<StepRecord>;

    async fn get_step(&self, step_id: &str) -> Result<StepRecord>;

    async fn update_step(&self, step_id: &str, update: StepUpdate) -> Result<StepRecord>;

    async fn list_steps(&self, run_id: &str) -> Result<Vec<StepRecord>>;

    // -- events --------------------------------------------------------------

    async fn create_event(&self, new: NewEvent) -> Result<EventRecord>;

    async fn list_events(&self, run_id: &str, params: ListEventsParams)
    -> Result<Page<EventRecord>>;

    async fn list_events_by_correlation(
        &self,
        correlation_id: &str,
        params: ListEventsParams,
    ) -> Result<Page<EventRecord>>;

    // -- hooks ---------------------------------------------------------------

    async fn create_hook(&self, new: NewHook, auth: &AuthContext) -> Result<HookRecord>;

    async fn get_hook_by_token(&self, token: &str) -> Result<HookRecord>;

    async fn list_hooks(&self, run_id: &str) -> Result<Vec<HookRecord>>;

    /// Remove a hook and return the prior row.
    async fn dispose_hook(&self, hook_id: &str) -> Result<HookRecord>;

    // -- stream chunks -------------------------------------------------------

    async fn append_chunk(
        &self,
        stream_id: &str,
        chunk_id: &str,
        data: &[u8],
        eof: bool,
    ) -> Result<()>;

    /// All chunks of a stream in ascending `chunk_id` order.
    async fn list_chunks(&self, stream_id: &str) -> Result<Vec<ChunkRecord>>;

    /// Chunks strictly after `last_chunk_id`, ascending, bounded by `limit`.
    async fn chunks_after(
        &self,
        stream_id: &str,
        last_chunk_id: &str,
        limit: i64,
    ) -> Result<Vec<ChunkRecord>>;

    async fn get_chunk(&self, stream_id: &str, chunk_id: &str) -> Result<Option<ChunkRecord>>;

    // -- jobs ----------------------------------------------------------------

    async fn insert_job(&self, job: &NewJob) -> Result<()>;

    async fn find_job_by_idempotency_key(&self, key: &str) -> Result<Option<JobRecord>>;

    /// Leasable candidates: due `pending` jobs plus `processing` jobs whose
    /// lease expired, in primary-key order.
    async fn due_jobs(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobRecord>>;

    /// Conditionally lease a job. Succeeds iff exactly one row moved to
    /// `processing`; a false return means another worker won the race.
    async fn try_lease_job(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<bool>;

    async fn complete_job(&self, job_id: &str) -> Result<()>;

    /// Put a failed job back on the queue for a later attempt.
    async fn retry_job(
        &self,
        job_id: &str,
        scheduled_for: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    async fn fail_job(&self, job_id: &str, error: &str) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;
}
