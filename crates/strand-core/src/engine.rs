// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application-facing engine API.
//!
//! [`Engine`] is what resource drivers and API layers talk to: they create
//! strands, raise signals on them and read their state. They never touch a
//! strand's stack or label directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{CoreError, Result};
use crate::frame::Frame;
use crate::persistence::{ExecutionRecord, Persistence};
use crate::registry::{START_LABEL, WorkflowRegistry};
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Parameters of a strand to create.
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Explicit id, typically the id of the subject entity. Random if unset.
    pub id: Option<Uuid>,
    /// Registered workflow type.
    pub workflow_type: String,
    /// Initial label.
    pub label: String,
    /// Outermost frame parameters; an object or null.
    pub params: Value,
    /// Earliest first dispatch. Immediately if unset.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewRecord {
    /// A strand of `workflow_type` starting at [`START_LABEL`].
    pub fn new(workflow_type: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            workflow_type: workflow_type.into(),
            label: START_LABEL.to_string(),
            params,
            run_at: None,
        }
    }

    /// Use an explicit id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Start at `label` instead of [`START_LABEL`].
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Delay the first dispatch.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// Handle to the strand engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    persistence: Arc<dyn Persistence>,
    registry: Arc<WorkflowRegistry>,
    dispatcher: Dispatcher,
    lease_ttl: Duration,
}

impl Engine {
    /// Create an engine over a store and a workflow registry.
    pub fn new(persistence: Arc<dyn Persistence>, registry: Arc<WorkflowRegistry>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            dispatcher: Dispatcher::new(persistence.clone(), registry.clone())
                .with_yield_backoff(defaults.yield_backoff),
            persistence,
            registry,
            lease_ttl: defaults.lease_ttl,
        }
    }

    /// Apply lease and backoff settings from a scheduler configuration.
    pub fn with_config(mut self, config: &SchedulerConfig) -> Self {
        self.lease_ttl = config.lease_ttl;
        self.dispatcher = self.dispatcher.with_yield_backoff(config.yield_backoff);
        self
    }

    /// The underlying store.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// The workflow registry.
    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Build a scheduler driving this engine's strands.
    pub fn scheduler(&self, config: SchedulerConfig) -> Scheduler {
        let dispatcher = self.dispatcher.clone().with_yield_backoff(config.yield_backoff);
        Scheduler::new(self.persistence.clone(), dispatcher, config)
    }

    /// Create a strand of `workflow_type` at [`START_LABEL`]. Returns its id.
    pub async fn create_record(&self, workflow_type: &str, params: Value) -> Result<Uuid> {
        self.create_record_with(NewRecord::new(workflow_type, params))
            .await
    }

    /// Create a strand from a full description. Returns its id.
    pub async fn create_record_with(&self, new: NewRecord) -> Result<Uuid> {
        self.registry.resolve(&new.workflow_type, &new.label)?;

        let frame = Frame::from_value(new.params).map_err(|message| CoreError::ValidationError {
            field: "params".to_string(),
            message,
        })?;

        let now = Utc::now();
        let mut record = ExecutionRecord::new(
            new.id.unwrap_or_else(Uuid::new_v4),
            new.workflow_type,
            new.label,
            frame,
            now,
        );
        if let Some(run_at) = new.run_at {
            record.next_run_at = run_at;
        }

        self.persistence.insert_record(&record).await?;

        info!(
            strand_id = %record.id,
            workflow_type = %record.workflow_type,
            label = %record.label,
            "Strand created"
        );

        Ok(record.id)
    }

    /// Raise a named signal on a strand. Durable once this returns.
    ///
    /// Finished strands never run their hook again, so signalling them is
    /// rejected with [`CoreError::RecordTerminal`].
    pub async fn raise_signal(&self, id: Uuid, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CoreError::ValidationError {
                field: "name".to_string(),
                message: "signal name must not be empty".to_string(),
            });
        }

        let record = self.load_record(id).await?;
        if record.is_terminal() {
            return Err(CoreError::RecordTerminal {
                strand_id: id.to_string(),
                status: record.status.to_string(),
            });
        }

        self.persistence.raise_signal(id, name, Utc::now()).await?;
        info!(strand_id = %id, signal = %name, "Signal raised");
        Ok(())
    }

    /// Whether the named signal is pending on a strand.
    pub async fn has_signal(&self, id: Uuid, name: &str) -> Result<bool> {
        self.persistence.has_signal(id, name).await
    }

    /// Load a strand.
    pub async fn load_record(&self, id: Uuid) -> Result<ExecutionRecord> {
        self.persistence
            .get_record(id)
            .await?
            .ok_or_else(|| CoreError::RecordNotFound {
                strand_id: id.to_string(),
            })
    }

    /// Running strands at `label`, optionally of one workflow type.
    pub async fn records_in_label(
        &self,
        workflow_type: Option<&str>,
        label: &str,
    ) -> Result<Vec<ExecutionRecord>> {
        self.persistence.list_by_label(workflow_type, label).await
    }

    /// Children of a strand that have not been collected yet.
    pub async fn children(&self, id: Uuid) -> Result<Vec<ExecutionRecord>> {
        self.persistence.list_children(id).await
    }

    /// Delete a strand and its signals. Returns whether it existed.
    pub async fn delete_record(&self, id: Uuid) -> Result<bool> {
        let deleted = self.persistence.delete_record(id).await?;
        if deleted {
            info!(strand_id = %id, "Strand deleted");
        }
        Ok(deleted)
    }

    /// Lease and run one step of a strand as of `now`, outside the scheduler.
    ///
    /// Skips strands that are leased or terminal. The strand does not have
    /// to be due, which lets tests and tools drive strands step by step.
    pub async fn dispatch(&self, id: Uuid, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let owner = format!("engine/{}", Uuid::new_v4());
        self.dispatcher
            .lease_and_dispatch(id, &owner, self.lease_ttl, now)
            .await
    }
}
