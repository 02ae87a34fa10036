// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for strand-core.
//!
//! [`CoreError`] covers store and engine failures with stable error codes.
//! [`StepError`] is what a label handler hands back to the dispatcher when a
//! step cannot produce a [`Step`](crate::step::Step).

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while storing or dispatching strands.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Strand was not found in the store.
    RecordNotFound {
        /// The strand ID that was not found.
        strand_id: String,
    },

    /// Strand already exists (duplicate create).
    RecordAlreadyExists {
        /// The strand ID that already exists.
        strand_id: String,
    },

    /// Optimistic save lost: the record changed since it was loaded,
    /// or the caller no longer holds its lease.
    StaleRecord {
        /// The strand ID.
        strand_id: String,
        /// The version the caller loaded.
        expected_version: i64,
    },

    /// The record is terminal and cannot be mutated or leased.
    RecordTerminal {
        /// The strand ID.
        strand_id: String,
        /// The terminal status.
        status: String,
    },

    /// No workflow with this name is registered.
    UnknownWorkflow {
        /// The workflow type name.
        workflow_type: String,
    },

    /// The workflow has no handler for this label.
    UnknownLabel {
        /// The workflow type name.
        workflow_type: String,
        /// The label that has no handler.
        label: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            Self::RecordAlreadyExists { .. } => "RECORD_ALREADY_EXISTS",
            Self::StaleRecord { .. } => "STALE_RECORD",
            Self::RecordTerminal { .. } => "RECORD_TERMINAL",
            Self::UnknownWorkflow { .. } => "UNKNOWN_WORKFLOW",
            Self::UnknownLabel { .. } => "UNKNOWN_LABEL",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same operation later can succeed.
    ///
    /// Unknown workflows and labels are contract violations and stay broken.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleRecord { .. } | Self::DatabaseError { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecordNotFound { strand_id } => {
                write!(f, "Strand '{}' not found", strand_id)
            }
            Self::RecordAlreadyExists { strand_id } => {
                write!(f, "Strand '{}' already exists", strand_id)
            }
            Self::StaleRecord {
                strand_id,
                expected_version,
            } => {
                write!(
                    f,
                    "Strand '{}' was modified concurrently (expected version {})",
                    strand_id, expected_version
                )
            }
            Self::RecordTerminal { strand_id, status } => {
                write!(f, "Strand '{}' is already {}", strand_id, status)
            }
            Self::UnknownWorkflow { workflow_type } => {
                write!(f, "Workflow '{}' is not registered", workflow_type)
            }
            Self::UnknownLabel {
                workflow_type,
                label,
            } => {
                write!(
                    f,
                    "Workflow '{}' has no handler for label '{}'",
                    workflow_type, label
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Why a single step failed to produce a [`Step`](crate::step::Step).
///
/// `InvalidPrimitive` is fatal: the dispatcher marks the strand failed.
/// Everything else aborts the step without saving, and the strand is retried
/// from its last committed state once its lease expires.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The handler broke the control-primitive contract.
    #[error("invalid primitive usage: {0}")]
    InvalidPrimitive(String),

    /// A store operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The handler body failed (remote call, parse error, ...).
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl StepError {
    /// Shorthand for a contract violation.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidPrimitive(message.into())
    }

    /// Whether the dispatcher should fail the strand instead of retrying it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidPrimitive(_) => true,
            Self::Core(err) => !err.is_retryable(),
            Self::Handler(_) => false,
        }
    }
}
