// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for strand-core.
//!
//! Both backends ship embedded migrations creating the `strands` and
//! `signals` tables. Applications embedding the engine run them once at
//! startup, before handing a pool to a persistence backend.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use strand_core::migrations;
//! use strand_core::persistence::PostgresPersistence;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_postgres(&pool).await?;
//! let persistence = PostgresPersistence::new(pool);
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator (JSONB stack, TIMESTAMPTZ columns).
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator (TEXT columns throughout).
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run PostgreSQL migrations. Already-applied migrations are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Run SQLite migrations. Already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
