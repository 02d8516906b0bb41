//! End-to-end derivation scenarios across engine, workers, and dispatcher

use chrono::{DateTime, TimeZone, Utc};
use delivery_gateway::domain::delivery::DeliveryStatus;
use delivery_gateway::domain::event::PresenceEvent;
use delivery_gateway::infra::{Config, Metrics};
use delivery_gateway::services::task_queue::TaskState;
use delivery_gateway::services::{
    create_effect_channel, create_ingest_workers, DeliveryLedger, DerivationEngine, EngineAction,
    EngineError, GateLocks, IngestTask, RetryPolicy, TaskStatusStore,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::watch;

fn test_config() -> Config {
    let mut temp_file = NamedTempFile::new().unwrap();
    let content = r#"
[site]
id = "test"

[[gates]]
uid = "gate01"

[[gates]]
uid = "gate02"

[[gates]]
uid = "gate03"
"#;
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    Config::from_file(temp_file.path()).unwrap()
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn event(uid: &str, gate: &str, status: &str, at: i64) -> PresenceEvent {
    PresenceEvent::new(uid, gate, status, ts(at))
}

fn build_engine(locks: GateLocks) -> Arc<DerivationEngine> {
    let metrics = Arc::new(Metrics::new());
    let ledger = Arc::new(DeliveryLedger::new());
    let (effects, _effect_rx) = create_effect_channel(64, metrics.clone());
    Arc::new(DerivationEngine::new(test_config(), ledger, locks, effects, metrics))
}

#[test]
fn scenario_a_truck_event_opens_delivery() {
    let engine = build_engine(GateLocks::new(Duration::from_secs(30)));

    let outcome = engine.handle_event(&event("E1", "gate03", "Truck", 0)).unwrap();

    let EngineAction::Opened(delivery) = outcome.action else {
        panic!("expected an opened delivery");
    };
    assert_eq!(delivery.delivery_uid, "E1");
    assert_eq!(delivery.status, DeliveryStatus::Open);
    assert_eq!(delivery.start, ts(0));
    assert!(delivery.end.is_none());
}

#[test]
fn scenario_b_no_truck_closes_same_delivery() {
    let engine = build_engine(GateLocks::new(Duration::from_secs(30)));
    engine.handle_event(&event("E1", "gate03", "Truck", 0)).unwrap();

    let outcome = engine.handle_event(&event("E2", "gate03", "NoTruck", 60)).unwrap();

    let EngineAction::Closed(delivery) = outcome.action else {
        panic!("expected a closed delivery");
    };
    assert_eq!(delivery.delivery_uid, "E1");
    assert_eq!(delivery.status, DeliveryStatus::Closed);
    assert_eq!(delivery.end, Some(ts(60)));
    assert!(delivery.start <= delivery.end.unwrap());
}

#[test]
fn scenario_c_unregistered_gate_rejected_without_mutation() {
    let engine = build_engine(GateLocks::new(Duration::from_secs(30)));

    let err = engine.handle_event(&event("E1", "gate99", "Truck", 0)).unwrap_err();

    assert!(matches!(err, EngineError::UnknownGate { .. }));
    assert_eq!(engine.ledger().delivery_count(), 0);
}

#[test]
fn scenario_d_racing_truck_events_open_exactly_one_delivery() {
    let engine = build_engine(GateLocks::new(Duration::from_secs(30)));

    // The loser of the lease race fails with LockContention and is retried
    // by the queue; its retry observes the opened delivery and no-ops.
    let first = engine.handle_event(&event("E1", "gate03", "Truck", 0)).unwrap();
    assert!(matches!(first.action, EngineAction::Opened(_)));

    let second = engine.handle_event(&event("E2", "gate03", "Truck", 0)).unwrap();
    assert!(matches!(second.action, EngineAction::NoOp));

    assert_eq!(engine.ledger().delivery_count(), 1);
    assert_eq!(engine.ledger().open_count(), 1);
}

#[test]
fn repeated_cycles_never_overlap() {
    let engine = build_engine(GateLocks::new(Duration::from_secs(30)));

    for cycle in 0..4 {
        let base = cycle * 100;
        engine
            .handle_event(&event(&format!("T{cycle}"), "gate01", "Truck", base))
            .unwrap();
        engine
            .handle_event(&event(&format!("N{cycle}"), "gate01", "NoTruck", base + 50))
            .unwrap();
    }

    let upper = Utc::now() + chrono::Duration::days(1);
    let (mut deliveries, total) =
        engine.ledger().list_range(Some("gate01"), ts(-1_000), upper, 1, 100);
    assert_eq!(total, 4);

    deliveries.sort_by_key(|d| d.start);
    for pair in deliveries.windows(2) {
        assert!(pair[0].end.unwrap() <= pair[1].start);
    }
}

#[tokio::test]
async fn worker_pool_processes_open_close_sequence() {
    let engine = build_engine(GateLocks::new(Duration::from_secs(30)));
    let metrics = Arc::new(Metrics::new());
    let status = TaskStatusStore::new();
    let retry = RetryPolicy {
        max_retries: 5,
        backoff: Duration::from_millis(2),
        backoff_cap: Duration::from_millis(10),
    };
    let (sender, workers) =
        create_ingest_workers(2, 32, engine.clone(), status.clone(), retry, metrics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for worker in workers {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            worker.run(rx).await;
        });
    }

    sender.enqueue(IngestTask { task_id: "t1".to_string(), event: event("E1", "gate02", "Truck", 0) });
    sender.enqueue(IngestTask {
        task_id: "t2".to_string(),
        event: event("E2", "gate02", "NoTruck", 60),
    });

    // Per-gate FIFO: t1 must open before t2 closes
    wait_for_done(&status, "t1").await;
    wait_for_done(&status, "t2").await;

    let last = engine.ledger().last_delivery("gate02").unwrap();
    assert_eq!(last.status, DeliveryStatus::Closed);
    assert_eq!(last.delivery_uid, "E1");
    assert_eq!(engine.ledger().delivery_count(), 1);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn contended_task_retries_until_lease_frees() {
    let locks = GateLocks::new(Duration::from_secs(30));
    let engine = build_engine(locks.clone());
    let metrics = Arc::new(Metrics::new());
    let status = TaskStatusStore::new();
    let retry = RetryPolicy {
        max_retries: 10,
        backoff: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
    };
    let (sender, workers) =
        create_ingest_workers(1, 8, engine.clone(), status.clone(), retry, metrics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for worker in workers {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            worker.run(rx).await;
        });
    }

    let held = locks.try_acquire("gate01").unwrap();
    sender.enqueue(IngestTask { task_id: "t1".to_string(), event: event("E1", "gate01", "Truck", 0) });

    // Give the worker a couple of contended attempts, then free the lease
    tokio::time::sleep(Duration::from_millis(12)).await;
    assert!(matches!(status.get("t1"), TaskState::Started));
    drop(held);

    wait_for_done(&status, "t1").await;
    assert_eq!(engine.ledger().delivery_count(), 1);

    let _ = shutdown_tx.send(true);
}

async fn wait_for_done(status: &TaskStatusStore, task_id: &str) {
    for _ in 0..200 {
        match status.get(task_id) {
            TaskState::Done { .. } => return,
            TaskState::Failed { error } => panic!("task {task_id} failed: {error}"),
            _ => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    panic!("task {task_id} did not finish in time");
}
