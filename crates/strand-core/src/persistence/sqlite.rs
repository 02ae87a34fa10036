//! SQLite-backed persistence implementation.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::CoreError;

use super::{
    EncodedRecord, ExecutionRecord, Persistence, SignalDelta, StepCommit, StrandRow,
};

const SELECT_STRAND: &str = r#"
    SELECT id, parent_id, workflow_type, label, stack, status, result, error,
           lease_owner, lease_expires_at, next_run_at, collected_at, version,
           created_at, updated_at
    FROM strands
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already be migrated, see [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/strands.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrated(pool).await
    }

    /// Create a migrated, private in-memory database.
    ///
    /// Uses a single connection: every `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, CoreError> {
        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn insert_error(id: Uuid, err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return CoreError::RecordAlreadyExists {
            strand_id: id.to_string(),
        };
    }
    err.into()
}

async fn insert_strand(
    conn: &mut SqliteConnection,
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
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
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
    .map_err(|e| insert_error(record.id, e))?;

    Ok(())
}

/// Upsert-increment a signal. Returns false when the strand does not exist.
async fn raise_on(
    conn: &mut SqliteConnection,
    id: Uuid,
    name: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO signals (strand_id, name, count, created_at, updated_at)
        SELECT ?1, ?2, 1, ?3, ?3
        WHERE EXISTS (SELECT 1 FROM strands WHERE id = ?1)
        ON CONFLICT (strand_id, name) DO UPDATE SET
            count = count + 1,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn consume_on(conn: &mut SqliteConnection, id: Uuid, name: &str) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE signals
        SET count = MAX(count - 1, 0)
        WHERE strand_id = ?1 AND name = ?2
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM signals
        WHERE strand_id = ?1 AND name = ?2 AND count <= 0
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn delete_on(conn: &mut SqliteConnection, id: Uuid) -> Result<bool, CoreError> {
    sqlx::query("DELETE FROM signals WHERE strand_id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

    let result = sqlx::query("DELETE FROM strands WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn into_records(rows: Vec<StrandRow>) -> Result<Vec<ExecutionRecord>, CoreError> {
    rows.into_iter().map(ExecutionRecord::try_from).collect()
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

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_record(&self, record: &ExecutionRecord) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_strand(&mut conn, record).await
    }

    async fn get_record(&self, id: Uuid) -> Result<Option<ExecutionRecord>, CoreError> {
        let row = sqlx::query_as::<_, StrandRow>(&format!("{} WHERE id = ?", SELECT_STRAND))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(ExecutionRecord::try_from).transpose()
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<i64, CoreError> {
        let record = &commit.record;
        let encoded = EncodedRecord::encode(record)?;
        let new_version = record.version + 1;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE strands
            SET workflow_type = ?1,
                label = ?2,
                stack = ?3,
                status = ?4,
                result = ?5,
                error = ?6,
                lease_owner = ?7,
                lease_expires_at = ?8,
                next_run_at = ?9,
                version = ?10,
                updated_at = ?11
            WHERE id = ?12
              AND version = ?13
              AND lease_owner = ?14
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

        for child_id in &commit.collected {
            sqlx::query(
                r#"
                UPDATE strands
                SET collected_at = ?1
                WHERE id = ?2 AND parent_id = ?3 AND collected_at IS NULL
                "#,
            )
            .bind(commit.now)
            .bind(child_id.to_string())
            .bind(record.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        for delta in &commit.signals {
            match delta {
                SignalDelta::Raise { strand_id, name } => {
                    raise_on(&mut tx, *strand_id, name, commit.now).await?;
                }
                SignalDelta::Consume { strand_id, name } => {
                    consume_on(&mut tx, *strand_id, name).await?;
                }
            }
        }

        if record.is_terminal()
            && let Some(parent_id) = record.parent_id
        {
            sqlx::query(
                r#"
                UPDATE strands
                SET next_run_at = ?1
                WHERE id = ?2 AND status = 'running' AND next_run_at > ?1
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

    async fn poll_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM strands
            WHERE status = 'running'
              AND next_run_at <= ?1
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
            ORDER BY next_run_at ASC
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_ids(rows)
    }

    async fn try_lease(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE strands
            SET lease_owner = ?1, lease_expires_at = ?2
            WHERE id = ?3
              AND status = 'running'
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?4)
            "#,
        )
        .bind(owner)
        .bind(expires_at)
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE strands
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = ?1 AND lease_owner = ?2
            "#,
        )
        .bind(id.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = sqlx::query_as::<_, StrandRow>(&format!(
            "{} WHERE parent_id = ? AND collected_at IS NULL ORDER BY created_at ASC",
            SELECT_STRAND
        ))
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn list_by_label(
        &self,
        workflow_type: Option<&str>,
        label: &str,
    ) -> Result<Vec<ExecutionRecord>, CoreError> {
        let rows = sqlx::query_as::<_, StrandRow>(&format!(
            r#"{}
            WHERE status = 'running'
              AND label = ?1
              AND (?2 IS NULL OR workflow_type = ?2)
            ORDER BY created_at ASC"#,
            SELECT_STRAND
        ))
        .bind(label)
        .bind(workflow_type)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn delete_record(&self, id: Uuid) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_on(&mut tx, id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn raise_signal(&self, id: Uuid, name: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        if !raise_on(&mut conn, id, name, now).await? {
            return Err(CoreError::RecordNotFound {
                strand_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn consume_signal(&self, id: Uuid, name: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        consume_on(&mut tx, id, name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_signals(&self, id: Uuid) -> Result<HashMap<String, i64>, CoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT name, count
            FROM signals
            WHERE strand_id = ? AND count > 0
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
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
              AND s.updated_at < ?1
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
            LIMIT ?2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_ids(rows)
    }

    async fn delete_records_batch(&self, ids: &[Uuid]) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for id in ids {
            if delete_on(&mut tx, *id).await? {
                deleted += 1;
            }
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::persistence::RecordStatus;
    use chrono::Duration;
    use serde_json::json;

    async fn test_persistence() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite persistence")
    }

    fn new_record(now: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord::new(
            Uuid::new_v4(),
            "Test",
            "start",
            Frame::from_value(json!({"subject": "vm-1"})).unwrap(),
            now,
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_record() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let record = new_record(now);

        persistence.insert_record(&record).await.unwrap();

        let loaded = persistence
            .get_record(record.id)
            .await
            .unwrap()
            .expect("record should exist");

        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.workflow_type, "Test");
        assert_eq!(loaded.label, "start");
        assert_eq!(loaded.status, RecordStatus::Running);
        assert_eq!(loaded.stack, record.stack);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_insert_duplicate_record() {
        let persistence = test_persistence().await;
        let record = new_record(Utc::now());

        persistence.insert_record(&record).await.unwrap();
        let err = persistence.insert_record(&record).await.unwrap_err();

        assert!(matches!(err, CoreError::RecordAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_get_record_not_found() {
        let persistence = test_persistence().await;
        let result = persistence.get_record(Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_poll_due_orders_by_next_run_at() {
        let persistence = test_persistence().await;
        let now = Utc::now();

        let mut late = new_record(now);
        late.next_run_at = now - Duration::seconds(5);
        let mut early = new_record(now);
        early.next_run_at = now - Duration::seconds(60);
        let mut future = new_record(now);
        future.next_run_at = now + Duration::seconds(60);

        for record in [&late, &early, &future] {
            persistence.insert_record(record).await.unwrap();
        }

        let due = persistence.poll_due(now, 10).await.unwrap();
        assert_eq!(due, vec![early.id, late.id]);

        let limited = persistence.poll_due(now, 1).await.unwrap();
        assert_eq!(limited, vec![early.id]);
    }

    #[tokio::test]
    async fn test_try_lease_is_exclusive_until_expiry() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let record = new_record(now);
        persistence.insert_record(&record).await.unwrap();

        let ttl = Duration::seconds(120);
        assert!(persistence.try_lease(record.id, "a", now + ttl, now).await.unwrap());
        assert!(!persistence.try_lease(record.id, "b", now + ttl, now).await.unwrap());

        // Leased strands are not due.
        assert!(persistence.poll_due(now, 10).await.unwrap().is_empty());

        // After expiry the lease can be taken over.
        let later = now + ttl + Duration::seconds(1);
        assert_eq!(persistence.poll_due(later, 10).await.unwrap(), vec![record.id]);
        assert!(persistence.try_lease(record.id, "b", later + ttl, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_lease_only_by_owner() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let record = new_record(now);
        persistence.insert_record(&record).await.unwrap();

        let expires = now + Duration::seconds(120);
        assert!(persistence.try_lease(record.id, "a", expires, now).await.unwrap());

        persistence.release_lease(record.id, "b").await.unwrap();
        assert!(!persistence.try_lease(record.id, "b", expires, now).await.unwrap());

        persistence.release_lease(record.id, "a").await.unwrap();
        assert!(persistence.try_lease(record.id, "b", expires, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_record_is_optimistic() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let record = new_record(now);
        persistence.insert_record(&record).await.unwrap();
        persistence
            .try_lease(record.id, "a", now + Duration::seconds(120), now)
            .await
            .unwrap();

        let mut loaded = persistence.get_record(record.id).await.unwrap().unwrap();
        let stale_copy = loaded.clone();

        loaded.label = "next".to_string();
        let version = persistence.save_record(&loaded, "a", now).await.unwrap();
        assert_eq!(version, 1);

        // A second writer holding the old version loses.
        let err = persistence
            .save_record(&stale_copy, "a", now)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StaleRecord { expected_version: 0, .. }));

        // A writer that does not hold the lease loses too.
        loaded.version = version;
        let err = persistence.save_record(&loaded, "b", now).await.unwrap_err();
        assert!(matches!(err, CoreError::StaleRecord { .. }));

        let stored = persistence.get_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.label, "next");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_signal_counter_floors_at_zero() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let record = new_record(now);
        persistence.insert_record(&record).await.unwrap();

        persistence.raise_signal(record.id, "destroy", now).await.unwrap();
        persistence.raise_signal(record.id, "destroy", now).await.unwrap();
        assert_eq!(
            persistence.load_signals(record.id).await.unwrap().get("destroy"),
            Some(&2)
        );

        persistence.consume_signal(record.id, "destroy").await.unwrap();
        assert!(persistence.has_signal(record.id, "destroy").await.unwrap());

        persistence.consume_signal(record.id, "destroy").await.unwrap();
        persistence.consume_signal(record.id, "destroy").await.unwrap();
        assert!(!persistence.has_signal(record.id, "destroy").await.unwrap());

        persistence.raise_signal(record.id, "destroy", now).await.unwrap();
        assert_eq!(
            persistence.load_signals(record.id).await.unwrap().get("destroy"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_raise_signal_unknown_strand() {
        let persistence = test_persistence().await;
        let err = persistence
            .raise_signal(Uuid::new_v4(), "destroy", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_commit_step_inserts_children_and_collects() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let parent = new_record(now);
        persistence.insert_record(&parent).await.unwrap();
        persistence
            .try_lease(parent.id, "w", now + Duration::seconds(60), now)
            .await
            .unwrap();

        let mut child = new_record(now);
        child.parent_id = Some(parent.id);

        let mut commit = StepCommit::record_only(parent.clone(), "w", now);
        commit.record.label = "wait".to_string();
        commit.children.push(child.clone());
        commit.signals.push(SignalDelta::Raise {
            strand_id: child.id,
            name: "checkup".to_string(),
        });
        persistence.commit_step(&commit).await.unwrap();

        let children = persistence.list_children(parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
        assert!(persistence.has_signal(child.id, "checkup").await.unwrap());

        let mut parent = persistence.get_record(parent.id).await.unwrap().unwrap();
        let mut collect = StepCommit::record_only(parent.clone(), "w", now);
        collect.collected.push(child.id);
        parent.version = persistence.commit_step(&collect).await.unwrap();

        assert!(persistence.list_children(parent.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_commit_writes_nothing() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let parent = new_record(now);
        persistence.insert_record(&parent).await.unwrap();

        // Not leased by "w", so the commit must be rejected as a whole.
        let mut child = new_record(now);
        child.parent_id = Some(parent.id);
        let mut commit = StepCommit::record_only(parent.clone(), "w", now);
        commit.children.push(child.clone());

        let err = persistence.commit_step(&commit).await.unwrap_err();
        assert!(matches!(err, CoreError::StaleRecord { .. }));
        assert!(persistence.get_record(child.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_child_nudges_parent() {
        let persistence = test_persistence().await;
        let now = Utc::now();

        let mut parent = new_record(now);
        parent.next_run_at = now + Duration::seconds(300);
        persistence.insert_record(&parent).await.unwrap();

        let mut child = new_record(now);
        child.parent_id = Some(parent.id);
        persistence.insert_record(&child).await.unwrap();
        persistence
            .try_lease(child.id, "w", now + Duration::seconds(60), now)
            .await
            .unwrap();

        let mut done = child.clone();
        done.status = RecordStatus::Completed;
        done.result = Some(json!("ok"));
        done.lease_owner = None;
        done.lease_expires_at = None;
        persistence.save_record(&done, "w", now).await.unwrap();

        let parent = persistence.get_record(parent.id).await.unwrap().unwrap();
        assert_eq!(parent.next_run_at, now);
        assert_eq!(persistence.poll_due(now, 10).await.unwrap(), vec![parent.id]);
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let persistence = test_persistence().await;
        let now = Utc::now();

        let mut waiting = new_record(now);
        waiting.label = "wait_host".to_string();
        let mut other_type = new_record(now);
        other_type.label = "wait_host".to_string();
        other_type.workflow_type = "Other".to_string();
        let started = new_record(now);

        for record in [&waiting, &other_type, &started] {
            persistence.insert_record(record).await.unwrap();
        }

        let all = persistence.list_by_label(None, "wait_host").await.unwrap();
        assert_eq!(all.len(), 2);

        let typed = persistence
            .list_by_label(Some("Test"), "wait_host")
            .await
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].id, waiting.id);
    }

    #[tokio::test]
    async fn test_delete_record_removes_signals() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let record = new_record(now);
        persistence.insert_record(&record).await.unwrap();
        persistence.raise_signal(record.id, "destroy", now).await.unwrap();

        assert!(persistence.delete_record(record.id).await.unwrap());
        assert!(!persistence.delete_record(record.id).await.unwrap());
        assert!(persistence.load_signals(record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collectable_records() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let old = now - Duration::days(40);

        let mut finished_root = new_record(old);
        finished_root.status = RecordStatus::Completed;
        let mut orphaned_child = new_record(old);
        orphaned_child.status = RecordStatus::Completed;
        orphaned_child.parent_id = Some(finished_root.id);

        let waiting_root = new_record(old);
        let mut pending_child = new_record(old);
        pending_child.status = RecordStatus::Failed;
        pending_child.parent_id = Some(waiting_root.id);
        let mut collected_child = new_record(old);
        collected_child.status = RecordStatus::Completed;
        collected_child.parent_id = Some(waiting_root.id);
        collected_child.collected_at = Some(old);

        let mut vanished_parent_child = new_record(old);
        vanished_parent_child.status = RecordStatus::Completed;
        vanished_parent_child.parent_id = Some(Uuid::new_v4());

        for record in [
            &finished_root,
            &orphaned_child,
            &waiting_root,
            &pending_child,
            &collected_child,
            &vanished_parent_child,
        ] {
            persistence.insert_record(record).await.unwrap();
        }

        let mut ids = persistence
            .get_collectable_records(now - Duration::days(30), 10)
            .await
            .unwrap();
        ids.sort();
        let mut expected = vec![
            finished_root.id,
            orphaned_child.id,
            collected_child.id,
            vanished_parent_child.id,
        ];
        expected.sort();
        assert_eq!(ids, expected);

        assert_eq!(persistence.delete_records_batch(&ids).await.unwrap(), 4);
        assert!(persistence.get_record(finished_root.id).await.unwrap().is_none());
        // The running parent may still collect it.
        assert!(persistence.get_record(pending_child.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_health_check_db() {
        let persistence = test_persistence().await;
        assert!(persistence.health_check_db().await.unwrap());
    }
}
