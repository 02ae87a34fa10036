// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stack frames.
//!
//! A frame is one level of a strand's call stack. The reserved fields are
//! owned by the engine; everything a workflow stores for itself lives in
//! `params`, nested under its own key so any parameter name is allowed:
//!
//! ```json
//! {
//!   "params": {"subject_id": "7f6c...", "vm_size": "standard-2"},
//!   "link": {"workflow_type": "Vm", "label": "wait_setup"},
//!   "deadline": {"target": "wait", "expires_at": "2025-01-01T00:10:00Z"},
//!   "children": ["1b2e..."]
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Where a pushed frame returns to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLink {
    /// Workflow type of the calling frame.
    pub workflow_type: String,
    /// Label the caller resumes at once the pushed frame returns.
    pub label: String,
}

/// Expiry marker registered by a workflow for the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    /// Label that satisfies the deadline; `None` means "until termination".
    pub target: Option<String>,
    /// When the deadline expires.
    pub expires_at: DateTime<Utc>,
}

impl Deadline {
    /// Whether a strand sitting at `label` has reached this deadline's target.
    pub fn is_satisfied_by(&self, label: &str) -> bool {
        self.target.as_deref() == Some(label)
    }

    /// Whether the deadline is past due for a strand sitting at `label`.
    pub fn is_exceeded(&self, label: &str, now: DateTime<Utc>) -> bool {
        !self.is_satisfied_by(label) && now >= self.expires_at
    }

    /// Human readable description of what the strand was waiting for.
    pub fn describe_target(&self) -> String {
        match &self.target {
            Some(target) => format!("'{}'", target),
            None => "termination".to_string(),
        }
    }
}

/// One level of a strand's call stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Back-link to the caller. Absent on the outermost frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<FrameLink>,

    /// Deadline registered for this frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Deadline>,

    /// Spawned children not yet collected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Uuid>,

    /// Result of the most recent completed sub-call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retval: Option<Value>,

    /// Workflow-defined parameters and locals.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl Frame {
    /// Create an outermost frame holding `params`.
    pub fn new(params: Map<String, Value>) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Create a frame for a sub-call returning to `link`.
    pub fn pushed(link: FrameLink, params: Map<String, Value>) -> Self {
        Self {
            link: Some(link),
            params,
            ..Self::default()
        }
    }

    /// Build a frame from an arbitrary JSON value.
    ///
    /// Objects become `params`; `null` becomes an empty frame. Anything else is
    /// rejected because frames are key/value documents.
    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(map) => Ok(Self::new(map)),
            Value::Null => Ok(Self::default()),
            other => Err(format!("frame params must be an object, got {}", other)),
        }
    }

    /// Raw parameter lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Typed parameter lookup. Missing keys and type mismatches both yield `None`.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.params
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Set a parameter, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.params.insert(key.into(), value.into())
    }

    /// Remove a parameter.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.params.remove(key)
    }

    /// Whether this frame has no spawned children left to collect.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
