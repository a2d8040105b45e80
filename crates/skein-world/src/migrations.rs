// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations, one directory per back-end.
//!
//! The schema is fixed (six tables); products embedding the world call
//! these to set it up programmatically instead of shipping SQL scripts.

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with the world schema embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// MySQL migrator with the world schema embedded.
pub static MYSQL: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/mysql");

/// SQLite migrator with the world schema embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations. Safe to call repeatedly; applied migrations
/// are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run MySQL migrations. Safe to call repeatedly; applied migrations are
/// skipped.
pub async fn run_mysql(pool: &sqlx::MySqlPool) -> Result<(), MigrateError> {
    MYSQL.run(pool).await
}

/// Run SQLite migrations. Safe to call repeatedly; applied migrations are
/// skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
