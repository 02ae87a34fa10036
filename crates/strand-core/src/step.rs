// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control primitives.
//!
//! A label handler receives a [`StepContext`] and returns exactly one
//! [`Step`]. The context exposes the current frame, the strand's signals,
//! child management and deadlines. Everything a handler does through it is
//! buffered and written in a single commit together with the step's outcome,
//! so a crashed or aborted step leaves no trace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StepError;
use crate::frame::{Deadline, Frame, FrameLink};
use crate::persistence::{ExecutionRecord, Persistence, RecordStatus, SignalDelta, StepCommit};
use crate::registry::{START_LABEL, WorkflowRegistry};

/// The single outcome of a label handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Move to another label of the same workflow and run it right away.
    Transition(String),
    /// Stay at the current label and run it again after this many seconds.
    /// Zero means the next scheduler pass.
    Suspend(u64),
    /// Finish the current frame with a value.
    Return(Value),
    /// Wait for children: suspend for the engine's child backoff.
    Yield,
    /// Call another workflow in-process by pushing a frame. Its `Return`
    /// resumes this strand at the current label with `retval` set.
    Push {
        /// Workflow type of the new frame.
        workflow_type: String,
        /// Label the pushed frame starts at.
        label: String,
        /// Parameters of the new frame; must be an object or null.
        params: Value,
    },
}

impl Step {
    /// `Transition` to `label`.
    pub fn transition(label: impl Into<String>) -> Self {
        Self::Transition(label.into())
    }

    /// `Suspend` for `seconds`.
    pub fn suspend(seconds: u64) -> Self {
        Self::Suspend(seconds)
    }

    /// `Return` with `value`.
    pub fn ret(value: impl Into<Value>) -> Self {
        Self::Return(value.into())
    }

    /// `Push` a sub-call starting at [`START_LABEL`].
    pub fn push(workflow_type: impl Into<String>, params: Value) -> Self {
        Self::push_at(workflow_type, START_LABEL, params)
    }

    /// `Push` a sub-call starting at `label`.
    pub fn push_at(workflow_type: impl Into<String>, label: impl Into<String>, params: Value) -> Self {
        Self::Push {
            workflow_type: workflow_type.into(),
            label: label.into(),
            params,
        }
    }
}

/// Terminal outcome of a collected child.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildResult {
    /// The child's outermost frame returned this value.
    Completed(Value),
    /// The child failed with this reason.
    Failed(String),
}

/// A child strand collected by its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildOutcome {
    /// Child strand id.
    pub id: Uuid,
    /// Child workflow type.
    pub workflow_type: String,
    /// What the child ended with.
    pub result: ChildResult,
}

impl ChildOutcome {
    fn from_record(record: ExecutionRecord) -> Self {
        let result = match record.status {
            RecordStatus::Failed => {
                ChildResult::Failed(record.error.unwrap_or_else(|| "failed".to_string()))
            }
            _ => ChildResult::Completed(record.result.unwrap_or(Value::Null)),
        };

        Self {
            id: record.id,
            workflow_type: record.workflow_type,
            result,
        }
    }

    /// Whether the child completed normally.
    pub fn is_success(&self) -> bool {
        matches!(self.result, ChildResult::Completed(_))
    }
}

#[derive(Default)]
struct Effects {
    children: Vec<ExecutionRecord>,
    collected: Vec<Uuid>,
    signals: Vec<SignalDelta>,
}

/// Everything a handler may see and touch during one dispatch.
pub struct StepContext {
    /// The record with its innermost frame taken out into `frame`.
    record: ExecutionRecord,
    frame: Frame,
    signals: HashMap<String, i64>,
    now: DateTime<Utc>,
    persistence: Arc<dyn Persistence>,
    registry: Arc<WorkflowRegistry>,
    effects: Effects,
}

fn after(now: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>, StepError> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| StepError::invalid(format!("delay of {} seconds is out of range", seconds)))
}

impl StepContext {
    pub(crate) fn new(
        mut record: ExecutionRecord,
        signals: HashMap<String, i64>,
        now: DateTime<Utc>,
        persistence: Arc<dyn Persistence>,
        registry: Arc<WorkflowRegistry>,
    ) -> Result<Self, StepError> {
        let frame = record
            .stack
            .pop()
            .ok_or_else(|| StepError::invalid("strand has an empty stack"))?;

        Ok(Self {
            record,
            frame,
            signals,
            now,
            persistence,
            registry,
            effects: Effects::default(),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Id of the dispatched strand (and of its subject entity).
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    /// Workflow type of the innermost frame.
    pub fn workflow_type(&self) -> &str {
        &self.record.workflow_type
    }

    /// Current label.
    pub fn label(&self) -> &str {
        &self.record.label
    }

    /// Dispatch time. Constant for the whole step.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Parent strand, for spawned children.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.record.parent_id
    }

    /// Number of frames on the stack, the current one included.
    pub fn depth(&self) -> usize {
        self.record.stack.len() + 1
    }

    /// The current frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Typed parameter of the current frame.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.frame.param(key)
    }

    /// Set a parameter of the current frame. Persisted with the step.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.frame.set(key, value);
    }

    /// Remove a parameter of the current frame.
    pub fn remove_param(&mut self, key: &str) -> Option<Value> {
        self.frame.remove(key)
    }

    /// Value returned by the last completed sub-call.
    pub fn retval(&self) -> Option<&Value> {
        self.frame.retval.as_ref()
    }

    /// Take the last sub-call result, clearing it.
    pub fn take_retval(&mut self) -> Option<Value> {
        self.frame.retval.take()
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Whether the named signal is pending on this strand.
    pub fn has_signal(&self, name: &str) -> bool {
        self.signals.get(name).is_some_and(|count| *count > 0)
    }

    /// Consume one occurrence of a pending signal. Returns false if none was
    /// pending. The decrement is persisted with the step.
    pub fn consume_signal(&mut self, name: &str) -> bool {
        match self.signals.get_mut(name) {
            Some(count) if *count > 0 => {
                *count -= 1;
                self.effects.signals.push(SignalDelta::Consume {
                    strand_id: self.record.id,
                    name: name.to_string(),
                });
                true
            }
            _ => false,
        }
    }

    /// Raise a signal on any strand. Delivered when this step commits and
    /// visible to the target from its next dispatch.
    pub fn raise_signal(&mut self, target: Uuid, name: impl Into<String>) {
        self.effects.signals.push(SignalDelta::Raise {
            strand_id: target,
            name: name.into(),
        });
    }

    // ========================================================================
    // Children
    // ========================================================================

    /// Spawn a child strand at [`START_LABEL`].
    pub fn spawn(&mut self, workflow_type: &str, params: Value) -> Result<Uuid, StepError> {
        self.spawn_at(workflow_type, START_LABEL, params)
    }

    /// Spawn a child strand at `label`.
    ///
    /// The child is created when this step commits and is tracked in the
    /// current frame until collected.
    pub fn spawn_at(
        &mut self,
        workflow_type: &str,
        label: &str,
        params: Value,
    ) -> Result<Uuid, StepError> {
        self.registry.resolve(workflow_type, label)?;
        let frame = Frame::from_value(params).map_err(StepError::InvalidPrimitive)?;

        let mut child = ExecutionRecord::new(Uuid::new_v4(), workflow_type, label, frame, self.now);
        child.parent_id = Some(self.record.id);
        let child_id = child.id;

        debug!(
            strand_id = %self.record.id,
            child_id = %child_id,
            workflow_type = %workflow_type,
            "Spawning child strand"
        );

        self.frame.children.push(child_id);
        self.effects.children.push(child);
        Ok(child_id)
    }

    /// Whether the current frame has no outstanding children.
    pub fn is_leaf(&self) -> bool {
        self.frame.is_leaf()
    }

    /// Collect terminal children of the current frame.
    ///
    /// Each child is returned exactly once: it leaves the frame now and is
    /// marked collected when the step commits.
    pub async fn collect(&mut self) -> Result<Vec<ChildOutcome>, StepError> {
        if self.frame.children.is_empty() {
            return Ok(Vec::new());
        }

        let stored = self.persistence.list_children(self.record.id).await?;
        let stored_ids: Vec<Uuid> = stored.iter().map(|child| child.id).collect();

        let mut outcomes = Vec::new();
        for child in stored {
            if !child.is_terminal() || !self.frame.children.contains(&child.id) {
                continue;
            }
            self.frame.children.retain(|id| *id != child.id);
            self.effects.collected.push(child.id);
            outcomes.push(ChildOutcome::from_record(child));
        }

        // Children deleted behind our back would be waited on forever.
        let pending: Vec<Uuid> = self.effects.children.iter().map(|child| child.id).collect();
        let record_id = self.record.id;
        self.frame.children.retain(|id| {
            let known = stored_ids.contains(id) || pending.contains(id);
            if !known {
                warn!(strand_id = %record_id, child_id = %id, "Dropping vanished child");
            }
            known
        });

        Ok(outcomes)
    }

    /// Collect, then `Transition(next_label)` once no children remain,
    /// otherwise `Yield`.
    pub async fn reap(&mut self, next_label: &str) -> Result<Step, StepError> {
        self.collect().await?;
        if self.is_leaf() {
            Ok(Step::transition(next_label))
        } else {
            Ok(Step::Yield)
        }
    }

    // ========================================================================
    // Deadlines
    // ========================================================================

    /// Require the strand to reach `target` (or terminate, for `None`)
    /// within `seconds`.
    ///
    /// Registering the same target again before it expires is a contract
    /// violation unless `allow_extension` is set. A different target
    /// replaces the current deadline.
    pub fn register_deadline(
        &mut self,
        target: Option<&str>,
        seconds: u64,
        allow_extension: bool,
    ) -> Result<(), StepError> {
        if let Some(existing) = &self.frame.deadline
            && existing.target.as_deref() == target
            && self.now < existing.expires_at
            && !allow_extension
        {
            return Err(StepError::invalid(format!(
                "deadline for {} is already registered",
                existing.describe_target()
            )));
        }

        self.frame.deadline = Some(Deadline {
            target: target.map(str::to_string),
            expires_at: after(self.now, seconds)?,
        });
        Ok(())
    }

    /// The deadline of the current frame.
    pub fn deadline(&self) -> Option<&Deadline> {
        self.frame.deadline.as_ref()
    }

    // ========================================================================
    // Step application
    // ========================================================================

    /// Apply `step` to the record. Contract violations are returned as
    /// [`StepError::InvalidPrimitive`] and leave the context unusable.
    pub(crate) fn apply(&mut self, step: Step, yield_backoff: Duration) -> Result<(), StepError> {
        let frame = std::mem::take(&mut self.frame);
        self.record.stack.push(frame);
        let now = self.now;
        let record = &mut self.record;

        match step {
            Step::Transition(target) => {
                let workflow = self.registry.get(&record.workflow_type).ok_or_else(|| {
                    StepError::invalid(format!("workflow '{}' vanished", record.workflow_type))
                })?;
                if !workflow.has_label(&target) {
                    return Err(StepError::invalid(format!(
                        "transition to unknown label '{}' in workflow '{}'",
                        target, record.workflow_type
                    )));
                }

                if let Some(frame) = record.stack.last_mut()
                    && frame.deadline.as_ref().is_some_and(|deadline| {
                        deadline.is_satisfied_by(&record.label) || deadline.is_satisfied_by(&target)
                    })
                {
                    frame.deadline = None;
                }

                record.label = target;
                record.next_run_at = now;
            }
            Step::Suspend(seconds) => {
                record.next_run_at = after(now, seconds)?;
            }
            Step::Yield => {
                record.next_run_at = chrono::Duration::from_std(yield_backoff)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| {
                        StepError::invalid(format!(
                            "yield backoff of {:?} is out of range",
                            yield_backoff
                        ))
                    })?;
            }
            Step::Return(value) => {
                if record.stack.len() == 1 {
                    record.status = RecordStatus::Completed;
                    record.result = Some(value);
                    record.next_run_at = now;
                } else {
                    let depth = record.stack.len();
                    let popped = record
                        .stack
                        .pop()
                        .ok_or_else(|| StepError::invalid("return from an empty stack"))?;
                    let link = popped.link.ok_or_else(|| {
                        StepError::invalid(format!(
                            "frame at depth {} has no back-link to return to",
                            depth
                        ))
                    })?;
                    let parent = record
                        .stack
                        .last_mut()
                        .ok_or_else(|| StepError::invalid("return without a caller frame"))?;

                    parent.retval = Some(value);
                    parent.children.extend(popped.children);
                    record.workflow_type = link.workflow_type;
                    record.label = link.label;
                    record.next_run_at = now;
                }
            }
            Step::Push {
                workflow_type,
                label,
                params,
            } => {
                self.registry.resolve(&workflow_type, &label)?;
                let params = Frame::from_value(params).map_err(StepError::InvalidPrimitive)?;
                let link = FrameLink {
                    workflow_type: std::mem::replace(&mut record.workflow_type, workflow_type),
                    label: std::mem::replace(&mut record.label, label),
                };
                record.stack.push(Frame::pushed(link, params.params));
                record.next_run_at = now;
            }
        }

        Ok(())
    }

    /// Turn the applied step into a commit that releases `lease_owner`.
    pub(crate) fn into_commit(self, lease_owner: &str) -> StepCommit {
        let mut record = self.record;
        record.lease_owner = None;
        record.lease_expires_at = None;
        record.updated_at = self.now;

        StepCommit {
            record,
            lease_owner: lease_owner.to_string(),
            children: self.effects.children,
            collected: self.effects.collected,
            signals: self.effects.signals,
            now: self.now,
        }
    }
}
