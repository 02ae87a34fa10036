// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow registry.
//!
//! A workflow is a named dispatch table mapping labels to handler functions,
//! plus an optional pre-step hook. The registry is built once, then shared
//! read-only by the engine, the dispatcher and every [`StepContext`].
//!
//! ```ignore
//! fn start(ctx: &mut StepContext) -> BoxFuture<'_, Result<Step, StepError>> {
//!     Box::pin(async move { Ok(Step::ret(json!({"msg": "done"}))) })
//! }
//!
//! let registry = WorkflowRegistry::builder()
//!     .register(Workflow::new("Echo").label("start", start))
//!     .build()?;
//! ```

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::{CoreError, StepError};
use crate::step::{Step, StepContext};

/// Label conventionally used as a workflow's entry point.
pub const START_LABEL: &str = "start";

/// Handler for a single label. Must produce exactly one [`Step`].
pub type LabelFn = for<'a> fn(&'a mut StepContext) -> BoxFuture<'a, Result<Step, StepError>>;

/// Pre-step hook run before every label handler of a workflow.
///
/// Returning `Some(step)` replaces the label handler for this dispatch.
pub type HookFn =
    for<'a> fn(&'a mut StepContext) -> BoxFuture<'a, Result<Option<Step>, StepError>>;

/// A named workflow: its label dispatch table and optional hook.
#[derive(Clone)]
pub struct Workflow {
    name: String,
    labels: HashMap<String, LabelFn>,
    before_run: Option<HookFn>,
}

impl Workflow {
    /// Start an empty workflow definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: HashMap::new(),
            before_run: None,
        }
    }

    /// Register the handler for `label`. Re-registering a label replaces it.
    pub fn label(mut self, label: impl Into<String>, handler: LabelFn) -> Self {
        self.labels.insert(label.into(), handler);
        self
    }

    /// Install the pre-step hook.
    pub fn before_run(mut self, hook: HookFn) -> Self {
        self.before_run = Some(hook);
        self
    }

    /// Workflow type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler registered for `label`.
    pub fn handler(&self, label: &str) -> Option<LabelFn> {
        self.labels.get(label).copied()
    }

    /// Whether `label` is part of the dispatch table.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    /// The pre-step hook, if any.
    pub fn hook(&self) -> Option<HookFn> {
        self.before_run
    }

    /// Registered labels, sorted.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.labels.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("labels", &self.labels())
            .field("before_run", &self.before_run.is_some())
            .finish()
    }
}

/// Immutable set of workflows known to an engine.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowRegistry {
    /// Start building a registry.
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder::default()
    }

    /// Look up a workflow by type name.
    pub fn get(&self, workflow_type: &str) -> Option<&Workflow> {
        self.workflows.get(workflow_type)
    }

    /// Resolve the handler for `(workflow_type, label)`.
    pub fn resolve(&self, workflow_type: &str, label: &str) -> Result<LabelFn, CoreError> {
        let workflow = self
            .get(workflow_type)
            .ok_or_else(|| CoreError::UnknownWorkflow {
                workflow_type: workflow_type.to_string(),
            })?;

        workflow
            .handler(label)
            .ok_or_else(|| CoreError::UnknownLabel {
                workflow_type: workflow_type.to_string(),
                label: label.to_string(),
            })
    }

    /// Number of registered workflows.
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Whether no workflow is registered.
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

/// Builder for [`WorkflowRegistry`].
#[derive(Default)]
pub struct WorkflowRegistryBuilder {
    workflows: Vec<Workflow>,
}

impl WorkflowRegistryBuilder {
    /// Add a workflow.
    pub fn register(mut self, workflow: Workflow) -> Self {
        self.workflows.push(workflow);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Fails on empty names, duplicate names, and workflows with no labels.
    pub fn build(self) -> Result<WorkflowRegistry, CoreError> {
        let mut workflows = HashMap::with_capacity(self.workflows.len());

        for workflow in self.workflows {
            if workflow.name.trim().is_empty() {
                return Err(CoreError::ValidationError {
                    field: "workflow_type".to_string(),
                    message: "workflow name must not be empty".to_string(),
                });
            }
            if workflow.labels.is_empty() {
                return Err(CoreError::ValidationError {
                    field: "labels".to_string(),
                    message: format!("workflow '{}' has no labels", workflow.name),
                });
            }
            if workflows.contains_key(&workflow.name) {
                return Err(CoreError::ValidationError {
                    field: "workflow_type".to_string(),
                    message: format!("workflow '{}' registered twice", workflow.name),
                });
            }
            workflows.insert(workflow.name.clone(), workflow);
        }

        Ok(WorkflowRegistry { workflows })
    }
}
