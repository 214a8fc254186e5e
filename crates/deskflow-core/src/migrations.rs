// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations.
//!
//! Both schemas are compiled into the crate. [`crate::persistence::connect`]
//! applies them when `DESKFLOW_RUN_MIGRATIONS` is on; deployments that manage
//! the schema themselves can call these functions directly instead.
//!
//! ```ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! deskflow_core::migrations::run_postgres(&pool).await?;
//! ```
//!
//! The initial migration also seeds the ticket statuses `open`,
//! `in_progress`, `pending`, `resolved` and `closed`.

use sqlx::migrate::MigrateError;

/// PostgreSQL schema.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite schema.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Apply pending PostgreSQL migrations. Already-applied ones are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Apply pending SQLite migrations. Already-applied ones are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
