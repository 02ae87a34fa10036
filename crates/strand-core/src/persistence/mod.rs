//! Persistence interfaces and backends for strand-core.
//!
//! This module defines the store contract the engine runs on and the two
//! shipped backends. Every method is atomic on its own; [`Persistence::commit_step`]
//! is the only multi-row write and runs in one transaction.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::frame::Frame;

/// Lifecycle status of a strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    /// Still executing; eligible for scheduling.
    Running,
    /// The outermost frame returned; `result` is set.
    Completed,
    /// Failed permanently (deadline exceeded or contract violation).
    Failed,
}

impl RecordStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal records are never leased or dispatched again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::DatabaseError {
                operation: "decode_status".to_string(),
                details: format!("unknown strand status '{}'", other),
            }),
        }
    }
}

/// A persisted, resumable workflow instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    /// Unique identifier; doubles as the key of the subject entity.
    pub id: Uuid,
    /// Strand that spawned this one, if any.
    pub parent_id: Option<Uuid>,
    /// Workflow type of the innermost frame.
    pub workflow_type: String,
    /// Current label.
    pub label: String,
    /// Call stack, innermost frame last.
    pub stack: Vec<Frame>,
    /// Lifecycle status.
    pub status: RecordStatus,
    /// Value returned by the outermost frame.
    pub result: Option<Value>,
    /// Failure reason for failed strands.
    pub error: Option<String>,
    /// Current lease holder.
    pub lease_owner: Option<String>,
    /// When the current lease lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time the scheduler may dispatch this strand.
    pub next_run_at: DateTime<Utc>,
    /// When the parent collected this strand's outcome.
    pub collected_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter.
    pub version: i64,
    /// When the strand was created.
    pub created_at: DateTime<Utc>,
    /// When the strand was last saved.
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Build a fresh running record with a single outermost frame.
    pub fn new(
        id: Uuid,
        workflow_type: impl Into<String>,
        label: impl Into<String>,
        frame: Frame,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent_id: None,
            workflow_type: workflow_type.into(),
            label: label.into(),
            stack: vec![frame],
            status: RecordStatus::Running,
            result: None,
            error: None,
            lease_owner: None,
            lease_expires_at: None,
            next_run_at: now,
            collected_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the strand has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The innermost frame.
    pub fn frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    /// Whether `owner` holds an unexpired lease at `now`.
    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease_owner.as_deref() == Some(owner)
            && self.lease_expires_at.is_some_and(|expires| expires > now)
    }
}

/// Raw row shape shared by both backends. JSON columns travel as text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StrandRow {
    /// Strand ID.
    pub id: String,
    /// Parent strand ID.
    pub parent_id: Option<String>,
    /// Workflow type.
    pub workflow_type: String,
    /// Current label.
    pub label: String,
    /// Serialized stack.
    pub stack: String,
    /// Status text.
    pub status: String,
    /// Serialized result.
    pub result: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
    /// Lease holder.
    pub lease_owner: Option<String>,
    /// Lease expiry.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Next dispatch time.
    pub next_run_at: DateTime<Utc>,
    /// Collection time.
    pub collected_at: Option<DateTime<Utc>>,
    /// Version counter.
    pub version: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last save time.
    pub updated_at: DateTime<Utc>,
}

fn parse_id(raw: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw).map_err(|e| CoreError::DatabaseError {
        operation: "decode_id".to_string(),
        details: format!("invalid strand id '{}': {}", raw, e),
    })
}

impl TryFrom<StrandRow> for ExecutionRecord {
    type Error = CoreError;

    fn try_from(row: StrandRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&row.id)?,
            parent_id: row.parent_id.as_deref().map(parse_id).transpose()?,
            workflow_type: row.workflow_type,
            label: row.label,
            stack: serde_json::from_str(&row.stack)?,
            status: row.status.parse()?,
            result: row
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: row.error,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            next_run_at: row.next_run_at,
            collected_at: row.collected_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Serialized JSON columns for a record about to be written.
pub(crate) struct EncodedRecord {
    pub stack: String,
    pub result: Option<String>,
}

impl EncodedRecord {
    pub fn encode(record: &ExecutionRecord) -> Result<Self, CoreError> {
        Ok(Self {
            stack: serde_json::to_string(&record.stack)?,
            result: record.result.as_ref().map(serde_json::to_string).transpose()?,
        })
    }
}

/// A signal mutation applied as part of a step commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDelta {
    /// Increment the named counter on a strand.
    Raise {
        /// Target strand.
        strand_id: Uuid,
        /// Signal name.
        name: String,
    },
    /// Decrement the named counter, floored at zero.
    Consume {
        /// Target strand.
        strand_id: Uuid,
        /// Signal name.
        name: String,
    },
}

/// Everything one dispatch step wants to persist, written atomically.
#[derive(Debug, Clone)]
pub struct StepCommit {
    /// New state of the dispatched record. Its `version` is the version that
    /// was loaded; the store bumps it on success.
    pub record: ExecutionRecord,
    /// Lease token the dispatcher holds.
    pub lease_owner: String,
    /// Children spawned during the step.
    pub children: Vec<ExecutionRecord>,
    /// Children whose outcome was collected during the step.
    pub collected: Vec<Uuid>,
    /// Signal raises and consumes issued during the step.
    pub signals: Vec<SignalDelta>,
    /// Commit time.
    pub now: DateTime<Utc>,
}

impl StepCommit {
    /// A commit that only saves the record.
    pub fn record_only(record: ExecutionRecord, lease_owner: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            record,
            lease_owner: lease_owner.into(),
            children: Vec::new(),
            collected: Vec::new(),
            signals: Vec::new(),
            now,
        }
    }
}

/// Persistence interface used by the engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new strand.
    async fn insert_record(&self, record: &ExecutionRecord) -> Result<(), CoreError>;

    /// Load a strand by id.
    async fn get_record(&self, id: Uuid) -> Result<Option<ExecutionRecord>, CoreError>;

    /// Persist one dispatch step atomically.
    ///
    /// Fails with [`CoreError::StaleRecord`] (and writes nothing) unless the
    /// stored version equals `commit.record.version` and `commit.lease_owner`
    /// still holds the lease. Returns the new version.
    async fn commit_step(&self, commit: &StepCommit) -> Result<i64, CoreError>;

    /// Optimistic save of a single record under lease. Returns the new version.
    async fn save_record(
        &self,
        record: &ExecutionRecord,
        lease_owner: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        self.commit_step(&StepCommit::record_only(record.clone(), lease_owner, now))
            .await
    }

    /// Ids of running, unleased (or lease-expired) strands due at `now`,
    /// oldest `next_run_at` first.
    async fn poll_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, CoreError>;

    /// Atomically claim a strand if it is running and unleased or its lease
    /// has expired. Returns whether the claim succeeded.
    async fn try_lease(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Drop a lease held by `owner`. No-op if someone else holds it.
    async fn release_lease(&self, id: Uuid, owner: &str) -> Result<(), CoreError>;

    /// Children of `parent_id` that have not been collected yet.
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<ExecutionRecord>, CoreError>;

    /// Strands currently at `label`, optionally restricted to a workflow type.
    async fn list_by_label(
        &self,
        workflow_type: Option<&str>,
        label: &str,
    ) -> Result<Vec<ExecutionRecord>, CoreError>;

    /// Delete a strand and its signals. Returns whether a row was removed.
    async fn delete_record(&self, id: Uuid) -> Result<bool, CoreError>;

    // ========================================================================
    // Signals
    // ========================================================================

    /// Increment a signal counter. Fails with `RecordNotFound` for unknown strands.
    async fn raise_signal(&self, id: Uuid, name: &str, now: DateTime<Utc>) -> Result<(), CoreError>;

    /// Decrement a signal counter, floored at zero.
    async fn consume_signal(&self, id: Uuid, name: &str) -> Result<(), CoreError>;

    /// All positive signal counters of a strand.
    async fn load_signals(&self, id: Uuid) -> Result<HashMap<String, i64>, CoreError>;

    /// Whether the named signal is pending.
    async fn has_signal(&self, id: Uuid, name: &str) -> Result<bool, CoreError> {
        Ok(self
            .load_signals(id)
            .await?
            .get(name)
            .is_some_and(|count| *count > 0))
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Terminal strands finished before `older_than` that nobody still needs.
    /// Children of a running parent qualify only once collected. Oldest first.
    async fn get_collectable_records(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, CoreError>;

    /// Delete strands (and their signals) by id. Returns the number removed.
    async fn delete_records_batch(&self, ids: &[Uuid]) -> Result<u64, CoreError>;

    /// Cheap connectivity check.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
