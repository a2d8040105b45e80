// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database adapter: connection pools per back-end plus a liveness probe.
//!
//! The adapter owns the pool; storage, queue and streamer borrow it per
//! call. PostgreSQL additionally hands out dedicated LISTEN/NOTIFY
//! connections for the streamer and the queue nudger.

use std::str::FromStr;
use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use tracing::{debug, warn};

use crate::config::{DatabaseKind, WorldConfig};
use crate::error::{Result, WorldError};

const POOL_MAX_CONNECTIONS: u32 = 10;
const SQLITE_MAX_CONNECTIONS: u32 = 5;
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection pool variants, one per back-end.
#[derive(Clone)]
pub enum DbPool {
    /// PostgreSQL pool.
    Postgres(PgPool),
    /// MySQL pool (connects lazily on first query).
    MySql(MySqlPool),
    /// SQLite pool over a single database file.
    Sqlite(SqlitePool),
}

/// Pooled access to the configured back-end.
#[derive(Clone)]
pub struct DbAdapter {
    kind: DatabaseKind,
    pool: DbPool,
}

impl DbAdapter {
    /// Build the pool for the configured back-end.
    ///
    /// PostgreSQL and MySQL pools are created lazily and validated by
    /// [`connect`](Self::connect); the SQLite file is created on the spot
    /// (with WAL journaling so concurrent readers do not block the writer).
    pub async fn open(config: &WorldConfig) -> Result<Self> {
        let pool = match config.database_kind {
            DatabaseKind::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(POOL_MAX_CONNECTIONS)
                    .connect_lazy(&config.connection_string)
                    .map_err(|e| WorldError::database("connect", e))?;
                DbPool::Postgres(pool)
            }
            DatabaseKind::MySql => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(POOL_MAX_CONNECTIONS)
                    .connect_lazy(&config.connection_string)
                    .map_err(|e| WorldError::database("connect", e))?;
                DbPool::MySql(pool)
            }
            DatabaseKind::Sqlite => {
                let options = sqlite_connect_options(&config.connection_string)?;
                let pool = SqlitePoolOptions::new()
                    .max_connections(SQLITE_MAX_CONNECTIONS)
                    .connect_with(options)
                    .await
                    .map_err(|e| WorldError::database("connect", e))?;
                DbPool::Sqlite(pool)
            }
        };

        Ok(Self {
            kind: config.database_kind,
            pool,
        })
    }

    /// The configured back-end kind.
    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// The underlying pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// The PostgreSQL pool, when that is the configured back-end.
    pub fn postgres_pool(&self) -> Option<&PgPool> {
        match &self.pool {
            DbPool::Postgres(pool) => Some(pool),
            _ => None,
        }
    }

    /// Validate the pool with a round-trip query.
    pub async fn connect(&self) -> Result<()> {
        self.ping()
            .await
            .map_err(|e| WorldError::database("connect", e))?;
        debug!(backend = %self.kind, "database connection validated");
        Ok(())
    }

    /// Liveness probe: a trivial `SELECT 1`. Returns false instead of
    /// erroring so health checks never throw.
    pub async fn is_healthy(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = %self.kind, error = %e, "health ping failed");
                false
            }
        }
    }

    /// Drain the pool and close all handles.
    pub async fn disconnect(&self) {
        match &self.pool {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }

    /// Open a dedicated LISTEN connection. Only meaningful on PostgreSQL;
    /// other back-ends return `None` and fall back to polling.
    pub async fn listener(&self) -> Result<Option<PgListener>> {
        match &self.pool {
            DbPool::Postgres(pool) => {
                let listener = PgListener::connect_with(pool)
                    .await
                    .map_err(|e| WorldError::database("listen", e))?;
                Ok(Some(listener))
            }
            _ => Ok(None),
        }
    }

    async fn ping(&self) -> std::result::Result<(), sqlx::Error> {
        match &self.pool {
            DbPool::Postgres(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DbPool::MySql(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DbPool::Sqlite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
        }
        Ok(())
    }
}

/// Build SQLite connect options from a connection string or bare path.
///
/// Accepts `sqlite:...` URLs, `:memory:` and plain file paths. Files are
/// created if missing and opened in WAL mode; an in-memory database keeps
/// its implicit journal mode.
fn sqlite_connect_options(connection_string: &str) -> Result<SqliteConnectOptions> {
    let url = if connection_string.starts_with("sqlite:") {
        connection_string.to_string()
    } else {
        format!("sqlite:{connection_string}")
    };

    let options = SqliteConnectOptions::from_str(&url)
        .map_err(|e| WorldError::database("connect", e))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(SQLITE_BUSY_TIMEOUT);

    Ok(options)
}
