// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spawning, collecting and reaping child strands.

mod common;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use common::*;
use strand_core::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use strand_core::{Engine, RecordStatus};

async fn child_named(engine: &Engine, parent: Uuid, name: &str) -> Uuid {
    engine
        .children(parent)
        .await
        .unwrap()
        .into_iter()
        .find(|child| child.stack[0].param::<String>("name").as_deref() == Some(name))
        .map(|child| child.id)
        .unwrap_or_else(|| panic!("no child named {}", name))
}

#[tokio::test]
async fn test_children_are_collected_exactly_once() {
    let engine = sqlite_engine().await;
    let parent = engine
        .create_record(
            "Fleet",
            json!({"nodes": [{"name": "a"}, {"name": "b", "fail": true}]}),
        )
        .await
        .unwrap();
    let t0 = Utc::now();

    let record = step(&engine, parent, t0).await;
    assert_eq!(record.label, "wait");
    assert_eq!(record.stack[0].children.len(), 2);

    let children = engine.children(parent).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|child| child.parent_id == Some(parent)));
    assert!(children.iter().all(|child| child.status == RecordStatus::Running));

    let a = child_named(&engine, parent, "a").await;
    let b = child_named(&engine, parent, "b").await;

    let node = step(&engine, a, t0).await;
    assert_eq!(node.status, RecordStatus::Completed);

    let record = step(&engine, parent, t0).await;
    assert_eq!(record.stack[0].children, vec![b]);
    assert_eq!(record.next_run_at, t0 + Duration::seconds(5));
    let results: Vec<Value> = record.stack[0].param("results").unwrap();
    assert_eq!(results, vec![json!({"id": a, "ok": {"booted": "a"}})]);

    // A second pass must not report "a" again.
    let record = step(&engine, parent, t0 + Duration::seconds(1)).await;
    let results: Vec<Value> = record.stack[0].param("results").unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(record.next_run_at, t0 + Duration::seconds(6));

    // A terminal child brings its parent forward.
    let outcome = engine.dispatch(b, t0 + Duration::seconds(2)).await.unwrap();
    assert!(matches!(outcome, strand_core::DispatchOutcome::Failed(_)));
    let waiting = engine.load_record(parent).await.unwrap();
    assert_eq!(waiting.next_run_at, t0 + Duration::seconds(2));

    let record = step(&engine, parent, t0 + Duration::seconds(2)).await;
    assert_eq!(record.label, "done");
    assert!(record.stack[0].children.is_empty());
    assert!(engine.children(parent).await.unwrap().is_empty());

    let record = step(&engine, parent, t0 + Duration::seconds(2)).await;
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(
        record.result,
        Some(json!([
            {"id": a, "ok": {"booted": "a"}},
            {"id": b, "error": "invalid primitive usage: node refused to boot"},
        ]))
    );

    let collected = engine.load_record(a).await.unwrap();
    assert!(collected.collected_at.is_some());
}

#[tokio::test]
async fn test_reap_waits_for_children() {
    let engine = sqlite_engine().await;
    let parent = engine.create_record("Reaper", json!({})).await.unwrap();
    let t0 = Utc::now();

    step(&engine, parent, t0).await;
    let record = step(&engine, parent, t0).await;
    assert_eq!(record.label, "wait");
    assert_eq!(record.stack[0].children.len(), 1);

    let child = record.stack[0].children[0];
    step(&engine, child, t0).await;

    let record = step(&engine, parent, t0).await;
    assert_eq!(record.label, "done");
    assert!(record.stack[0].children.is_empty());

    let record = step(&engine, parent, t0).await;
    assert_eq!(record.result, Some(json!("reaped")));
}

#[tokio::test]
async fn test_cleanup_removes_finished_family() {
    let engine = sqlite_engine().await;
    let parent = engine.create_record("Reaper", json!({})).await.unwrap();
    let t0 = Utc::now();

    let record = step(&engine, parent, t0).await;
    let child = record.stack[0].children[0];
    step(&engine, child, t0).await;
    step(&engine, parent, t0).await;
    step(&engine, parent, t0).await;

    let worker = CleanupWorker::new(
        engine.persistence().clone(),
        CleanupWorkerConfig {
            enabled: true,
            ..Default::default()
        },
    );

    assert_eq!(worker.run_once(t0 + Duration::days(1)).await.unwrap(), 0);
    assert_eq!(worker.run_once(t0 + Duration::days(31)).await.unwrap(), 2);
    assert!(engine.load_record(parent).await.is_err());
    assert!(engine.load_record(child).await.is_err());
}
