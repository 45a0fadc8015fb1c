//! Incremental snapshots running alongside streaming.

mod common;

use common::*;
use rivven_capture::{
    CaptureOrchestrator, EventOp, IncrementalConfig, Signal, SnapshotMarker, SnapshotMode,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_read_only_gtid_auto_start_reads_all_chunks() {
    init_test_logging();
    let upstream = upstream_with(&[("orders", 5)])
        .with_gtids(true)
        .with_read_only(true);
    let config = config(&["orders"])
        .with_snapshot_mode(SnapshotMode::Never)
        .with_read_only(true)
        .with_incremental(IncrementalConfig {
            chunk_size: 2,
            auto_start_tables: vec![format!("{}.orders", DATABASE)],
        });

    let orchestrator = CaptureOrchestrator::builder(config, Arc::new(upstream.clone()))
        .build()
        .await
        .unwrap();
    let collector = Collector::new();
    let pipeline = Pipeline::spawn(orchestrator, &collector);
    pipeline.wait_streaming().await;

    let records = collector.wait_for(5).await;
    pipeline
        .handle
        .wait_until(|s| !s.incremental_snapshot)
        .await;
    pipeline.stop().await;

    let keys: Vec<_> = records.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, (1..=5).map(|k| json!(k)).collect::<Vec<_>>());
    assert!(records
        .iter()
        .all(|r| r.op == EventOp::Read && r.snapshot == SnapshotMarker::Incremental));
    assert!(upstream.chunk_reads() >= 3);
}

#[tokio::test]
async fn test_read_only_chunk_waits_for_stream_to_catch_up() {
    init_test_logging();
    let upstream = upstream_with(&[("orders", 3)])
        .with_gtids(true)
        .with_read_only(true);
    let config = config(&["orders"])
        .with_snapshot_mode(SnapshotMode::Never)
        .with_read_only(true);

    let orchestrator = CaptureOrchestrator::builder(config, Arc::new(upstream.clone()))
        .build()
        .await
        .unwrap();
    let collector = Collector::new();
    let pipeline = Pipeline::spawn(orchestrator, &collector);
    pipeline.wait_streaming().await;

    upstream.update(&table("orders"), json!(2), json!({"id": 2, "name": "changed"}));
    collector.wait_for(1).await;
    pipeline
        .handle
        .send_signal(Signal::execute_snapshot(vec![format!("{}.orders", DATABASE)]))
        .await
        .unwrap();

    let records = collector.wait_for(4).await;
    pipeline.stop().await;

    assert_eq!(records[0].op, EventOp::Update);
    let snapshot: Vec<_> = records[1..].iter().collect();
    assert!(snapshot.iter().all(|r| r.snapshot == SnapshotMarker::Incremental));
    let changed = snapshot.iter().find(|r| r.key == json!(2)).unwrap();
    assert_eq!(changed.after.as_ref().unwrap()["name"], json!("changed"));
}

#[tokio::test]
async fn test_signal_table_snapshot_is_reconciled_with_stream() {
    init_test_logging();
    let upstream = upstream_with(&[("orders", 3), ("signals", 0)]);
    let config = config(&["orders"])
        .with_snapshot_mode(SnapshotMode::Never)
        .with_signal_data_collection(format!("{}.signals", DATABASE));

    let orchestrator = CaptureOrchestrator::builder(config, Arc::new(upstream.clone()))
        .build()
        .await
        .unwrap();
    let collector = Collector::new();
    let pipeline = Pipeline::spawn(orchestrator, &collector);
    pipeline.wait_streaming().await;

    pipeline
        .handle
        .send_signal(Signal::execute_snapshot(vec![format!("{}.orders", DATABASE)]))
        .await
        .unwrap();
    let snapshot = collector.wait_for(3).await;
    pipeline
        .handle
        .wait_until(|s| !s.incremental_snapshot)
        .await;

    upstream.insert(&table("orders"), json!(4), json!({"id": 4}));
    let records = collector.wait_for(4).await;
    pipeline.stop().await;

    assert!(snapshot
        .iter()
        .all(|r| r.op == EventOp::Read && r.snapshot == SnapshotMarker::Incremental));
    assert_eq!(records[3].op, EventOp::Insert);
    assert!(records.iter().all(|r| r.table == table("orders")));
    // Window markers were written to the signal table, never delivered.
    assert!(upstream.rows(&table("signals")).len() >= 2);
}

#[tokio::test]
async fn test_execute_snapshot_ignored_without_watermark_strategy() {
    init_test_logging();
    let upstream = upstream_with(&[("orders", 4)]);
    let orchestrator = CaptureOrchestrator::builder(
        config(&["orders"]).with_snapshot_mode(SnapshotMode::Never),
        Arc::new(upstream.clone()),
    )
    .build()
    .await
    .unwrap();
    let collector = Collector::new();
    let pipeline = Pipeline::spawn(orchestrator, &collector);
    pipeline.wait_streaming().await;

    pipeline
        .handle
        .send_signal(Signal::execute_snapshot(vec![format!("{}.orders", DATABASE)]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(collector.len(), 0);
    assert!(!pipeline.handle.status().incremental_snapshot);
    assert_eq!(upstream.chunk_reads(), 0);
    pipeline.stop().await;
}
