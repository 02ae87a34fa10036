// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! strand-core - Durable Strand Engine
//!
//! This crate provides a persistent, crash-resumable state-machine runtime.
//! Each workflow instance is a *strand*: a stored record holding the workflow
//! type, the current label and a stack of frames. A scheduler leases due
//! strands, runs one label handler per dispatch and commits the outcome, so a
//! crashed worker only ever loses the step it was running.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Application / API layer                          │
//! │        create_record · raise_signal · load_record · records_in_label    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌───────────────────────┐    ┌─────────────────────────────────────────────┐
//! │      Scheduler        │───▶│                 Dispatcher                   │
//! │ poll · lease · permit │    │ signals · deadline guard · hook · handler    │
//! └───────────────────────┘    └─────────────────────────────────────────────┘
//!           │                                        │ Step + effects
//!           ▼                                        ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                Persistence (SQLite or PostgreSQL)                       │
//! │              strands · signals · one transaction per step               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Control Primitives
//!
//! A label handler returns exactly one [`Step`]:
//!
//! | Step | Effect |
//! |------|--------|
//! | `Transition(label)` | Move to `label`, run again immediately |
//! | `Suspend(secs)` | Stay, run again after `secs` |
//! | `Return(value)` | Pop the frame into the caller's `retval`, or finish the strand |
//! | `Yield` | Wait for children, run again after the configured backoff |
//! | `Push { .. }` | Call another workflow in-process on a new frame |
//!
//! Through the [`StepContext`] a handler also spawns and collects children,
//! reads and consumes signals, and registers deadlines. All of it is written
//! in the same transaction as the step itself.
//!
//! # Strand Lifecycle
//!
//! ```text
//!   create_record
//!        │
//!        ▼
//!   ┌─────────┐  transition / suspend / yield / push / inner return
//!   │ RUNNING │◀──────────────────────────────────────┐
//!   └────┬────┘───────────────────────────────────────┘
//!        │
//!        ├── outermost return ───────────▶ COMPLETED
//!        └── deadline / contract breach ─▶ FAILED
//! ```
//!
//! Handler errors, panics and step timeouts do not change the status: the
//! step is discarded and the strand is retried once its lease expires.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STRAND_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `STRAND_WORKER_COUNT` | No | `8` | Concurrent dispatches |
//! | `STRAND_LEASE_TTL_SECS` | No | `120` | Lease duration |
//! | `STRAND_POLL_INTERVAL_MS` | No | `1000` | Idle poll interval |
//! | `STRAND_YIELD_BACKOFF_SECS` | No | `5` | Backoff of `Yield` |
//! | `STRAND_CLEANUP_ENABLED` | No | `false` | Delete old finished strands |
//! | `STRAND_CLEANUP_POLL_INTERVAL_SECS` | No | `3600` | Cleanup interval |
//! | `STRAND_CLEANUP_MAX_AGE_DAYS` | No | `30` | Retention period |
//! | `STRAND_CLEANUP_BATCH_SIZE` | No | `100` | Deletions per batch |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`persistence`]: Store contract with SQLite and PostgreSQL backends
//! - [`registry`]: Workflow dispatch tables
//! - [`step`]: Control primitives and the handler context
//! - [`dispatcher`]: Single-step execution
//! - [`scheduler`]: Polling loop and worker pool
//! - [`engine`]: Application-facing API
//! - [`runtime`]: Embeddable runtime wiring it all together

#![deny(missing_docs)]

/// Background deletion of old finished strands.
pub mod cleanup_worker;

/// Configuration loaded from environment variables.
pub mod config;

/// Single-step dispatch of leased strands.
pub mod dispatcher;

/// Application-facing engine API.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Stack frames and deadlines.
pub mod frame;

/// Embedded database migrations.
pub mod migrations;

/// Durable storage of strands and signals.
pub mod persistence;

/// Workflow registration.
pub mod registry;

/// Embeddable runtime with scheduler and cleanup tasks.
pub mod runtime;

/// Scheduler loop and worker pool.
pub mod scheduler;

/// Control primitives.
pub mod step;

pub use dispatcher::{DispatchOutcome, Dispatcher, SkipReason};
pub use engine::{Engine, NewRecord};
pub use error::{CoreError, StepError};
pub use frame::{Deadline, Frame, FrameLink};
pub use persistence::{ExecutionRecord, Persistence, RecordStatus};
pub use registry::{HookFn, LabelFn, START_LABEL, Workflow, WorkflowRegistry};
pub use runtime::StrandRuntime;
pub use step::{ChildOutcome, ChildResult, Step, StepContext};

// Handlers return boxed futures; re-exported so workflow crates need no extra import.
pub use futures::future::BoxFuture;
