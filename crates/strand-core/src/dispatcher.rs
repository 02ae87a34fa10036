// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-step dispatch.
//!
//! One dispatch runs one label handler of one leased strand:
//!
//! 1. load the record and verify the caller still holds its lease
//! 2. load pending signals
//! 3. enforce every frame's deadline
//! 4. run the pre-step hook, then resolve and run the label handler
//! 5. apply the returned [`Step`] and commit it together with its effects
//!
//! Contract violations fail the strand. Handler errors and panics abort the
//! step without saving; the lease is left to run out, so the strand is retried
//! from its last committed state one lease TTL later.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, StepError};
use crate::persistence::{ExecutionRecord, Persistence, RecordStatus, StepCommit};
use crate::registry::{Workflow, WorkflowRegistry};
use crate::step::{Step, StepContext};

/// Default backoff applied by [`Step::Yield`].
pub const DEFAULT_YIELD_BACKOFF: Duration = Duration::from_secs(5);

/// What happened to a strand during one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The step was committed. Holds the record as saved.
    Committed(ExecutionRecord),
    /// The strand was marked failed. Holds the record as saved.
    Failed(ExecutionRecord),
    /// The step was discarded; the strand will be retried once its lease expires.
    Aborted(String),
    /// Nothing was run.
    Skipped(SkipReason),
}

/// Why a dispatch did not run a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The strand does not exist.
    NotFound,
    /// The strand already finished.
    Terminal,
    /// Someone else holds the lease, or ours expired.
    NotLeased,
    /// The strand's workflow type is not registered here.
    UnknownWorkflow(String),
}

impl DispatchOutcome {
    /// The saved record, for committed and failed outcomes.
    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            Self::Committed(record) | Self::Failed(record) => Some(record),
            Self::Aborted(_) | Self::Skipped(_) => None,
        }
    }
}

/// Runs single steps of leased strands.
#[derive(Clone)]
pub struct Dispatcher {
    persistence: Arc<dyn Persistence>,
    registry: Arc<WorkflowRegistry>,
    yield_backoff: Duration,
}

/// Run the hook, then the label handler. `None` means the label has no handler.
async fn run_step(
    ctx: &mut StepContext,
    workflow: &Workflow,
) -> Result<Option<Step>, StepError> {
    if let Some(hook) = workflow.hook()
        && let Some(step) = hook(ctx).await?
    {
        return Ok(Some(step));
    }
    match workflow.handler(ctx.label()) {
        Some(handler) => handler(ctx).await.map(Some),
        None => Ok(None),
    }
}

impl Dispatcher {
    /// Create a dispatcher with the default yield backoff.
    pub fn new(persistence: Arc<dyn Persistence>, registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            persistence,
            registry,
            yield_backoff: DEFAULT_YIELD_BACKOFF,
        }
    }

    /// Override the backoff used by [`Step::Yield`].
    pub fn with_yield_backoff(mut self, backoff: Duration) -> Self {
        self.yield_backoff = backoff;
        self
    }

    /// Lease `id` for `lease_ttl` as `owner`, then dispatch it.
    pub async fn lease_and_dispatch(
        &self,
        id: Uuid,
        owner: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, CoreError> {
        let ttl = chrono::Duration::from_std(lease_ttl).map_err(|e| CoreError::ValidationError {
            field: "lease_ttl".to_string(),
            message: e.to_string(),
        })?;

        if !self.persistence.try_lease(id, owner, now + ttl, now).await? {
            debug!(strand_id = %id, "Strand not leasable, skipping");
            return Ok(DispatchOutcome::Skipped(SkipReason::NotLeased));
        }

        self.dispatch(id, owner, now).await
    }

    /// Run one step of a strand leased by `owner`.
    pub async fn dispatch(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, CoreError> {
        let Some(record) = self.persistence.get_record(id).await? else {
            return Ok(DispatchOutcome::Skipped(SkipReason::NotFound));
        };

        if record.is_terminal() {
            return Ok(DispatchOutcome::Skipped(SkipReason::Terminal));
        }

        if !record.is_leased_by(owner, now) {
            warn!(strand_id = %id, owner = %owner, "Lease not held, skipping dispatch");
            return Ok(DispatchOutcome::Skipped(SkipReason::NotLeased));
        }

        let signals = self.persistence.load_signals(id).await?;

        let exceeded = record
            .stack
            .iter()
            .filter_map(|frame| frame.deadline.as_ref())
            .find(|deadline| deadline.is_exceeded(&record.label, now))
            .map(|deadline| {
                format!(
                    "deadline exceeded while waiting for {}",
                    deadline.describe_target()
                )
            });
        if let Some(reason) = exceeded {
            return self.fail(record, owner, reason, now).await;
        }

        let Some(workflow) = self.registry.get(&record.workflow_type) else {
            warn!(
                strand_id = %id,
                workflow_type = %record.workflow_type,
                "No workflow registered for strand, leaving it to its lease"
            );
            return Ok(DispatchOutcome::Skipped(SkipReason::UnknownWorkflow(
                record.workflow_type,
            )));
        };

        debug!(
            strand_id = %id,
            workflow_type = %record.workflow_type,
            label = %record.label,
            "Dispatching strand"
        );

        let mut ctx = match StepContext::new(
            record.clone(),
            signals,
            now,
            self.persistence.clone(),
            self.registry.clone(),
        ) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(record, owner, e.to_string(), now).await,
        };

        let step = match AssertUnwindSafe(run_step(&mut ctx, workflow))
            .catch_unwind()
            .await
        {
            Ok(Ok(Some(step))) => step,
            Ok(Ok(None)) => {
                let reason = CoreError::UnknownLabel {
                    workflow_type: record.workflow_type.clone(),
                    label: record.label.clone(),
                }
                .to_string();
                return self.fail(record, owner, reason, now).await;
            }
            Ok(Err(e)) if e.is_fatal() => {
                return self.fail(record, owner, e.to_string(), now).await;
            }
            Ok(Err(e)) => {
                warn!(
                    strand_id = %id,
                    workflow_type = %record.workflow_type,
                    label = %record.label,
                    error = %e,
                    "Step failed, retrying after lease expiry"
                );
                return Ok(DispatchOutcome::Aborted(e.to_string()));
            }
            Err(_) => {
                error!(
                    strand_id = %id,
                    workflow_type = %record.workflow_type,
                    label = %record.label,
                    "Step panicked, retrying after lease expiry"
                );
                return Ok(DispatchOutcome::Aborted("handler panicked".to_string()));
            }
        };

        if let Err(e) = ctx.apply(step, self.yield_backoff) {
            return self.fail(record, owner, e.to_string(), now).await;
        }

        let commit = ctx.into_commit(owner);
        self.commit(commit).await
    }

    async fn commit(&self, commit: StepCommit) -> Result<DispatchOutcome, CoreError> {
        match self.persistence.commit_step(&commit).await {
            Ok(version) => {
                let mut record = commit.record;
                record.version = version;

                if record.is_terminal() {
                    info!(
                        strand_id = %record.id,
                        workflow_type = %record.workflow_type,
                        "Strand completed"
                    );
                } else {
                    debug!(
                        strand_id = %record.id,
                        label = %record.label,
                        next_run_at = %record.next_run_at,
                        "Step committed"
                    );
                }

                Ok(DispatchOutcome::Committed(record))
            }
            Err(e @ CoreError::StaleRecord { .. }) => {
                warn!(strand_id = %commit.record.id, error = %e, "Discarding stale step");
                Ok(DispatchOutcome::Aborted(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(
        &self,
        mut record: ExecutionRecord,
        owner: &str,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, CoreError> {
        error!(
            strand_id = %record.id,
            workflow_type = %record.workflow_type,
            label = %record.label,
            reason = %reason,
            "Failing strand"
        );

        record.status = RecordStatus::Failed;
        record.error = Some(reason);
        record.lease_owner = None;
        record.lease_expires_at = None;
        record.updated_at = now;

        match self.commit(StepCommit::record_only(record, owner, now)).await? {
            DispatchOutcome::Committed(record) => Ok(DispatchOutcome::Failed(record)),
            other => Ok(other),
        }
    }
}
