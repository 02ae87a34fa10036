// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence operations for strand-core on PostgreSQL.
//!
//! Provides all durable storage access functions for strands and signals.
//! JSON columns are `JSONB`; they are written with `::jsonb` casts and read
//! back as text so both backends share [`StrandRow`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::CoreError;

use super::{
    EncodedRecord, ExecutionRecord, Persistence, SignalDelta, StepCommit, StrandRow,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    ///
    /// The pool must already be migrated, see [`crate::migrations::run_postgres`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const SELECT_STRAND: &str = r#"
    SELECT id, parent_id, workflow_type, label, stack::text AS stack, status,
           result::text AS result, error, lease_owner, lease_expires_at,
           next_run_at, collected_at, version, created_at, updated_at
    FROM strands
"#;

// ============================================================================
// Strand Operations
// ============================================================================

/// Insert a strand row.
pub async fn insert_strand(
    conn: &mut PgConnection,
    record: &ExecutionRecord,
) -> Result<(), CoreError> {
    let encoded = EncodedRecord::encode(record)?;

    sqlx::query(
        r#"
        INSERT INTO strands (
            id, parent_id, workflow_type, label, stack, status, result, error,
            lease_owner, lease_expires_at, next_run_at, collected_at, version,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5::jsonb, $6, $7::jsonb, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.parent_id.map(|id| id.to_string()))
    .bind(&record.workflow_type)
    .bind(&record.label)
    .bind(&encoded.stack)
    .bind(record.status.as_str())
    .bind(&encoded.result)
    .bind(&record.error)
    .bind(&record.lease_owner)
    .bind(record.lease_expires_at)
    .bind(record.next_run_at)
    .bind(record.collected_at)
    .bind(record.version)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            CoreError::RecordAlreadyExists {
                strand_id: record.id.to_string(),
            }
        }
        _ => e.into(),
    })?;

    Ok(())
}

/// Get a strand by ID.
pub async fn get_strand(pool: &PgPool, id: Uuid) -> Result<Option<ExecutionRecord>, CoreError> {
    let row = sqlx::query_as::<_, StrandRow>(&format!("{} WHERE id = $1", SELECT_STRAND))
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(ExecutionRecord::try_from).transpose()
}

/// Persist one dispatch step in a single transaction.
pub async fn commit_step(pool: &PgPool, commit: &StepCommit) -> Result<i64, CoreError> {
    let record = &commit.record;
    let encoded = EncodedRecord::encode(record)?;
    let new_version = record.version + 1;

    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE strands
        SET workflow_type = $1,
            label = $2,
            stack = $3::jsonb,
            status = $4,
            result = $5::jsonb,
            error = $6,
            lease_owner = $7,
            lease_expires_at = $8,
            next_run_at = $9,
            version = $10,
            updated_at = $11
        WHERE id = $12
          AND version = $13
          AND lease_owner = $14
        "#,
    )
    .bind(&record.workflow_type)
    .bind(&record.label)
    .bind(&encoded.stack)
    .bind(record.status.as_str())
    .bind(&encoded.result)
    .bind(&record.error)
    .bind(&record.lease_owner)
    .bind(record.lease_expires_at)
    .bind(record.next_run_at)
    .bind(new_version)
    .bind(commit.now)
    .bind(record.id.to_string())
    .bind(record.version)
    .bind(&commit.lease_owner)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::StaleRecord {
            strand_id: record.id.to_string(),
            expected_version: record.version,
        });
    }

    for child in &commit.children {
        insert_strand(&mut tx, child).await?;
    }

    if !commit.collected.is_empty() {
        let ids: Vec<String> = commit.collected.iter().map(Uuid::to_string).collect();
        sqlx::query(
            r#"
            UPDATE strands
            SET collected_at = $1
            WHERE id = ANY($2) AND parent_id = $3 AND collected_at IS NULL
            "#,
        )
        .bind(commit.now)
        .bind(&ids)
        .bind(record.id.to_string())
        .execute(&mut *tx)
        .await?;
    }

    for delta in &commit.signals {
        match delta {
            SignalDelta::Raise { strand_id, name } => {
                raise_signal_on(&mut tx, *strand_id, name, commit.now).await?;
            }
            SignalDelta::Consume { strand_id, name } => {
                consume_signal_on(&mut tx, *strand_id, name).await?;
            }
        }
    }

    if record.is_terminal()
        && let Some(parent_id) = record.parent_id
    {
        sqlx::query(
            r#"
            UPDATE strands
            SET next_run_at = $1
            WHERE id = $2 AND status = 'running' AND next_run_at > $1
            "#,
        )
        .bind(commit.now)
        .bind(parent_id.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(new_version)
}

/// Delete a strand; its signals go with it through the foreign key.
pub async fn delete_strand(pool: &PgPool, id: Uuid) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM strands WHERE id = $1")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn into_ids(rows: Vec<(String,)>) -> Result<Vec<Uuid>, CoreError> {
    rows.into_iter()
        .map(|(id,)| {
            Uuid::parse_str(&id).map_err(|e| CoreError::DatabaseError {
                operation: "decode_id".to_string(),
                details: format!("invalid strand id '{}': {}", id, e),
            })
        })
        .collect()
}

// ============================================================================
// Scheduling Operations
// ============================================================================

/// Ids of due, unleased strands.
pub async fn poll_due(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>, CoreError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM strands
        WHERE status = 'running'
          AND next_run_at <= $1
          AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
        ORDER BY next_run_at ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    into_ids(rows)
}

/// Conditionally claim a strand.
pub async fn try_lease(
    pool: &PgPool,
    id: Uuid,
    owner: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE strands
        SET lease_owner = $1, lease_expires_at = $2
        WHERE id = $3
          AND status = 'running'
          AND (lease_expires_at IS NULL OR lease_expires_at <= $4)
        "#,
    )
    .bind(owner)
    .bind(expires_at)
    .bind(id.to_string())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Drop a lease held by `owner`.
pub async fn release_lease(pool: &PgPool, id: Uuid, owner: &str) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE strands
        SET lease_owner = NULL, lease_expires_at = NULL
        WHERE id = $1 AND lease_owner = $2
        "#,
    )
    .bind(id.to_string())
    .bind(owner)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Signal Operations
// ============================================================================

async fn raise_signal_on(
    conn: &mut PgConnection,
    id: Uuid,
    name: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO signals (strand_id, name, count, created_at, updated_at)
        SELECT $1, $2, 1, $3, $3
        WHERE EXISTS (SELECT 1 FROM strands WHERE id = $1)
        ON CONFLICT (strand_id, name) DO UPDATE SET
            count = signals.count + 1,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn consume_signal_on(conn: &mut PgConnection, id: Uuid, name: &str) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE signals
        SET count = GREATEST(count - 1, 0)
        WHERE strand_id = $1 AND name = $2
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM signals WHERE strand_id = $1 AND name = $2 AND count <= 0")
        .bind(id.to_string())
        .bind(name)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Load positive signal counters of a strand.
pub async fn load_signals(pool: &PgPool, id: Uuid) -> Result<HashMap<String, i64>, CoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT name, count
        FROM signals
        WHERE strand_id = $1 AND count > 0
        "#,
    )
    .bind(id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().collect())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_record(&self, record: &ExecutionRecord) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_strand(&mut conn, record).await
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ExecutionRecord>, CoreError> {
        get_strand(&self.pool, id).await
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<i64, CoreError> {
        commit_step(&self.pool, commit).await
    }

    async fn poll_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, CoreError> {
        poll_due(&self.pool, now, limit).await
    }

    async fn try_lease(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        try_lease(&self.pool, id, owner, expires_at, now).await
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), CoreError> {
        release_lease(&self.pool, id, owner).await
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = sqlx::query_as::<_, StrandRow>(&format!(
            "{} WHERE parent_id = $1 AND collected_at IS NULL ORDER BY created_at ASC",
            SELECT_STRAND
        ))
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }

    async fn list_by_label(
        &self,
        workflow_type: Option<&str>,
        label: &str,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = sqlx::query_as::<_, StrandRow>(&format!(
            r#"{}
            WHERE status = 'running'
              AND label = $1
              AND ($2::text IS NULL OR workflow_type = $2)
            ORDER BY created_at ASC"#,
            SELECT_STRAND
        ))
        .bind(label)
        .bind(workflow_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExecutionRecord::try_from).collect()
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool, CoreError> {
        delete_strand(&self.pool, id).await
    }

    async fn raise_signal(&self, id: Uuid, name: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        if !raise_signal_on(&mut conn, id, name, now).await? {
            return Err(CoreError::RecordNotFound {
                strand_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn consume_signal(&self, id: Uuid, name: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        consume_signal_on(&mut tx, id, name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_signals(&self, id: Uuid) -> Result<HashMap<String, i64>, CoreError> {
        load_signals(&self.pool, id).await
    }

    async fn get_collectable_records(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT s.id
            FROM strands s
            WHERE s.status IN ('completed', 'failed')
              AND s.updated_at < $1
              AND (
                  s.parent_id IS NULL
                  OR s.collected_at IS NOT NULL
                  -- nobody is left to collect it
                  OR NOT EXISTS (
                      SELECT 1 FROM strands p
                      WHERE p.id = s.parent_id AND p.status = 'running'
                  )
              )
            ORDER BY s.updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_ids(rows)
    }

    async fn delete_records_batch(&self, ids: &[Uuid]) -> Result<u64, CoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let result = sqlx::query("DELETE FROM strands WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
