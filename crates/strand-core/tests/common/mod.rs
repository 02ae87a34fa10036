// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for strand-core integration tests.
//!
//! Provides a small set of workflows exercising every control primitive and
//! helpers to build engines over SQLite (always) or PostgreSQL (when
//! `TEST_DATABASE_URL` is set).

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use strand_core::persistence::{Persistence, SqlitePersistence};
use strand_core::{
    BoxFuture, DispatchOutcome, Engine, ExecutionRecord, Step, StepContext, StepError, Workflow,
    WorkflowRegistry,
};

/// Skip the current test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Route engine logs to the test output. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

type StepResult<'a> = BoxFuture<'a, Result<Step, StepError>>;

// ============================================================================
// Echo: start -> done -> return "finished"
// ============================================================================

fn echo_start(_ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move { Ok(Step::transition("done")) })
}

fn echo_done(_ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move { Ok(Step::ret("finished")) })
}

// ============================================================================
// Vm: long-running, cancellable through the "cancel" signal
// ============================================================================

fn vm_before_run(ctx: &mut StepContext) -> BoxFuture<'_, Result<Option<Step>, StepError>> {
    Box::pin(async move {
        if ctx.label() != "teardown" && ctx.consume_signal("cancel") {
            return Ok(Some(Step::transition("teardown")));
        }
        Ok(None)
    })
}

fn vm_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        let polls = ctx.param::<u64>("polls").unwrap_or(0);
        ctx.set_param("polls", polls + 1);
        Ok(Step::suspend(30))
    })
}

fn vm_teardown(_ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move { Ok(Step::ret(json!({"msg": "vm deleted"}))) })
}

// ============================================================================
// Provision: must reach "ready" within 10 seconds
// ============================================================================

fn provision_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        ctx.register_deadline(Some("ready"), 10, false)?;
        Ok(Step::transition("wait"))
    })
}

fn provision_wait(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        if ctx.consume_signal("booted") {
            return Ok(Step::transition("ready"));
        }
        Ok(Step::suspend(5))
    })
}

fn provision_ready(_ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move { Ok(Step::ret("ready")) })
}

fn provision_rearm(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        ctx.register_deadline(Some("ready"), 10, false)?;
        ctx.register_deadline(Some("ready"), 20, false)?;
        Ok(Step::transition("wait"))
    })
}

// ============================================================================
// Watchdog: must terminate within 10 seconds, whatever label it sits at
// ============================================================================

fn watchdog_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        ctx.register_deadline(None, 10, false)?;
        Ok(Step::transition("poll"))
    })
}

fn watchdog_poll(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        if ctx.consume_signal("finished") {
            return Ok(Step::ret("clean exit"));
        }
        Ok(Step::suspend(3))
    })
}

// ============================================================================
// Fleet / Node: spawn children, collect them one by one
// ============================================================================

fn fleet_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        let nodes: Vec<Value> = ctx.param("nodes").unwrap_or_default();
        for node in nodes {
            ctx.spawn("Node", node)?;
        }
        ctx.set_param("results", json!([]));
        Ok(Step::transition("wait"))
    })
}

fn fleet_wait(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        let mut results: Vec<Value> = ctx.param("results").unwrap_or_default();
        for outcome in ctx.collect().await? {
            results.push(match outcome.result {
                strand_core::ChildResult::Completed(value) => {
                    json!({"id": outcome.id, "ok": value})
                }
                strand_core::ChildResult::Failed(error) => {
                    json!({"id": outcome.id, "error": error})
                }
            });
        }
        ctx.set_param("results", results);

        if ctx.is_leaf() {
            Ok(Step::transition("done"))
        } else {
            Ok(Step::Yield)
        }
    })
}

fn fleet_done(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        let results: Value = ctx.param("results").unwrap_or(Value::Null);
        Ok(Step::Return(results))
    })
}

fn node_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        if ctx.param::<bool>("fail").unwrap_or(false) {
            return Err(StepError::invalid("node refused to boot"));
        }
        let name: String = ctx.param("name").unwrap_or_default();
        Ok(Step::ret(json!({"booted": name})))
    })
}

// ============================================================================
// Reaper: spawn then reap("done")
// ============================================================================

fn reaper_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        ctx.spawn("Node", json!({"name": "solo"}))?;
        Ok(Step::transition("wait"))
    })
}

fn reaper_wait(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move { ctx.reap("done").await })
}

fn reaper_done(_ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move { Ok(Step::ret("reaped")) })
}

// ============================================================================
// Outer / Inner: in-process sub-call through push and return
// ============================================================================

fn outer_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        if let Some(doubled) = ctx.take_retval() {
            return Ok(Step::ret(json!({"doubled": doubled})));
        }
        let x: i64 = ctx.param("x").unwrap_or(0);
        Ok(Step::push("Inner", json!({"x": x})))
    })
}

fn inner_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        let x: i64 = ctx.param("x").unwrap_or(0);
        Ok(Step::ret(x * 2))
    })
}

// ============================================================================
// Flaky: fails the first attempt, succeeds afterwards
// ============================================================================

fn flaky_start(ctx: &mut StepContext) -> StepResult<'_> {
    Box::pin(async move {
        if !ctx.has_signal("healthy") {
            return Err(StepError::from(anyhow::anyhow!("remote API unavailable")));
        }
        Ok(Step::transition("done"))
    })
}

/// The registry shared by all integration tests.
pub fn registry() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register(
            Workflow::new("Echo")
                .label("start", echo_start)
                .label("done", echo_done),
        )
        .register(
            Workflow::new("Vm")
                .before_run(vm_before_run)
                .label("start", vm_start)
                .label("teardown", vm_teardown),
        )
        .register(
            Workflow::new("Provision")
                .label("start", provision_start)
                .label("rearm", provision_rearm)
                .label("wait", provision_wait)
                .label("ready", provision_ready),
        )
        .register(
            Workflow::new("Watchdog")
                .label("start", watchdog_start)
                .label("poll", watchdog_poll),
        )
        .register(
            Workflow::new("Fleet")
                .label("start", fleet_start)
                .label("wait", fleet_wait)
                .label("done", fleet_done),
        )
        .register(Workflow::new("Node").label("start", node_start))
        .register(
            Workflow::new("Reaper")
                .label("start", reaper_start)
                .label("wait", reaper_wait)
                .label("done", reaper_done),
        )
        .register(Workflow::new("Outer").label("start", outer_start))
        .register(Workflow::new("Inner").label("start", inner_start))
        .register(
            Workflow::new("Flaky")
                .label("start", flaky_start)
                .label("done", echo_done),
        )
        .build()
        .expect("test registry is valid")
}

/// Engine over a fresh in-memory SQLite database.
pub async fn sqlite_engine() -> Engine {
    init_tracing();
    let persistence = SqlitePersistence::in_memory()
        .await
        .expect("Failed to create in-memory SQLite persistence");
    Engine::new(Arc::new(persistence), Arc::new(registry()))
}

/// Engine over an existing store.
pub fn engine_with(persistence: Arc<dyn Persistence>) -> Engine {
    init_tracing();
    Engine::new(persistence, Arc::new(registry()))
}

/// Dispatch and expect a committed step.
pub async fn step(engine: &Engine, id: Uuid, now: DateTime<Utc>) -> ExecutionRecord {
    match engine.dispatch(id, now).await.expect("dispatch failed") {
        DispatchOutcome::Committed(record) => record,
        other => panic!("expected a committed step for {}, got {:?}", id, other),
    }
}
