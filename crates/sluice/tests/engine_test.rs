//! End-to-end runs of the engine against the in-memory source

mod common;

use common::*;
use sluice::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn config(batch_size: usize) -> ExtractionConfig {
    ExtractionConfig::default().with_batch_size(batch_size)
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
    }
}

// ==================== Run Lifecycle Tests ====================

#[tokio::test]
async fn test_first_run_full_then_incremental() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=100);
    let h = Harness::new(&source);
    let engine = h.engine(config(25)).await;

    let first = engine.run(CancellationToken::new()).await.unwrap();
    let orders = first.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Full);
    assert_eq!(orders.status, TableStatus::Completed);
    assert_eq!(orders.rows, 100);
    assert_eq!(orders.batches, 4);
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(100)));

    source.insert_rows("orders", 101..=150);
    let second = engine.run(CancellationToken::new()).await.unwrap();
    let orders = second.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Incremental);
    assert_eq!(orders.rows, 50);
    assert_eq!(orders.final_watermark, Some(Value::Int64(150)));
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(150)));

    let (sql, params) = source.queries_for("orders").pop().unwrap();
    assert!(sql.contains(r#"WHERE "id" > $1"#));
    assert_eq!(params, vec![Value::Int64(100)]);
    assert_eq!(h.delivered_ids("orders"), (1..=150).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_unchanged_source_delivers_nothing() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    let h = Harness::new(&source);
    let engine = h.engine(config(100)).await;

    engine.run(CancellationToken::new()).await.unwrap();
    let report = engine.run(CancellationToken::new()).await.unwrap();
    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Incremental);
    assert_eq!(orders.rows, 0);
    assert_eq!(orders.final_watermark, Some(Value::Int64(10)));
}

#[tokio::test]
async fn test_batches_have_exact_size_except_last() {
    let source = MockSource::new();
    source.add_serial_table("events", 1..=103);
    let h = Harness::new(&source);
    let engine = h.engine(config(10)).await;

    engine.run(CancellationToken::new()).await.unwrap();

    let sizes: Vec<usize> = h
        .sink
        .batches_for(&tid("events"))
        .iter()
        .map(|b| b.len())
        .collect();
    assert_eq!(sizes.len(), 11);
    assert!(sizes[..10].iter().all(|&n| n == 10));
    assert_eq!(sizes[10], 3);
}

#[tokio::test]
async fn test_table_without_key_is_always_full() {
    let source = MockSource::new();
    source.add_table(
        "countries",
        vec![
            ColumnDescriptor::new("code", "char(2)").primary_key(1),
            ColumnDescriptor::new("name", "text"),
        ],
        vec![Row::new(
            vec!["code".into(), "name".into()],
            vec![Value::from("NL"), Value::from("Netherlands")],
        )],
    );
    let h = Harness::new(&source);
    let engine = h.engine(config(10)).await;

    engine.run(CancellationToken::new()).await.unwrap();
    let report = engine.run(CancellationToken::new()).await.unwrap();
    let countries = report.table(&tid("countries")).unwrap();
    assert_eq!(countries.mode, ExtractionMode::Full);
    assert_eq!(countries.rows, 1);
    assert!(h.watermark("countries").await.is_none());
}

// ==================== Schema Evolution Tests ====================

#[tokio::test]
async fn test_added_table_is_full_despite_stale_checkpoint() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    let h = Harness::new(&source);
    h.checkpoints
        .commit(&tid("orders"), "id", &Value::Int64(500))
        .await
        .unwrap();

    let engine = h.engine(config(100)).await;
    let report = engine.run(CancellationToken::new()).await.unwrap();

    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Full);
    assert_eq!(orders.rows, 10);
    assert_eq!(report.invalidated, vec![tid("orders")]);
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(10)));
}

#[tokio::test]
async fn test_added_column_keeps_incremental() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    let h = Harness::new(&source);
    let engine = h.engine(config(100)).await;
    engine.run(CancellationToken::new()).await.unwrap();

    let mut columns = serial_columns();
    columns.push(ColumnDescriptor::new("note", "text"));
    source.set_columns("orders", columns);
    source.insert_rows("orders", 11..=12);

    let report = engine.run(CancellationToken::new()).await.unwrap();
    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Incremental);
    assert_eq!(orders.rows, 2);
}

#[tokio::test]
async fn test_widened_key_column_resumes_incremental() {
    let source = MockSource::new();
    let int_row = |id: i32| {
        Row::new(
            vec!["id".into(), "payload".into()],
            vec![Value::Int32(id), Value::String(format!("row-{}", id))],
        )
    };
    source.add_table(
        "orders",
        vec![
            ColumnDescriptor::new("id", "integer").primary_key(1).auto_increment(),
            ColumnDescriptor::new("payload", "text"),
        ],
        (1..=10).map(int_row).collect(),
    );
    let h = Harness::new(&source);
    let engine = h.engine(config(100)).await;
    engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(h.watermark("orders").await, Some(Value::Int32(10)));

    // ALTER COLUMN id TYPE bigint rewrites every stored key
    source.drop_table("orders");
    source.add_serial_table("orders", 1..=15);

    let report = engine.run(CancellationToken::new()).await.unwrap();
    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Incremental);
    assert_eq!(orders.status, TableStatus::Completed);
    assert_eq!(orders.rows, 5);

    let (_, params) = source.queries_for("orders").pop().unwrap();
    assert_eq!(params, vec![Value::Int64(10)]);
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(15)));
}

#[tokio::test]
async fn test_lost_incremental_key_forces_full_reload() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    let h = Harness::new(&source);
    let engine = h.engine(config(100)).await;
    engine.run(CancellationToken::new()).await.unwrap();

    // id is no longer auto-increment, so no key qualifies
    source.set_columns(
        "orders",
        vec![
            ColumnDescriptor::new("id", "bigint").primary_key(1),
            ColumnDescriptor::new("payload", "text"),
        ],
    );

    let report = engine.run(CancellationToken::new()).await.unwrap();
    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Full);
    assert_eq!(orders.rows, 10);
    assert_eq!(report.invalidated, vec![tid("orders")]);

    let cp = h.checkpoints.load(&tid("orders")).await.unwrap().unwrap();
    assert_eq!(cp.status, CheckpointStatus::Invalidated);
}

#[tokio::test]
async fn test_removed_table_is_orphaned_then_resumed() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.add_serial_table("audit", 1..=5);
    let h = Harness::new(&source);
    let engine = h.engine(config(100)).await;
    engine.run(CancellationToken::new()).await.unwrap();

    let dropped = source.drop_table("orders").unwrap();
    let report = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.orphaned, vec![tid("orders")]);
    assert!(report.table(&tid("orders")).is_none());
    let cp = h.checkpoints.load(&tid("orders")).await.unwrap().unwrap();
    assert_eq!(cp.status, CheckpointStatus::Orphaned);

    // same structure comes back: resume where it left off
    source.restore_table("orders", dropped);
    source.insert_rows("orders", 11..=15);
    let report = engine.run(CancellationToken::new()).await.unwrap();
    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Incremental);
    assert_eq!(orders.rows, 5);
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(15)));
}

#[tokio::test]
async fn test_configured_full_reload_table() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    let h = Harness::new(&source);
    let engine = h.engine(config(100).with_full_reload("public.orders")).await;

    engine.run(CancellationToken::new()).await.unwrap();
    let report = engine.run(CancellationToken::new()).await.unwrap();
    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.mode, ExtractionMode::Full);
    assert_eq!(orders.rows, 10);
    assert!(h.watermark("orders").await.is_none());
}

// ==================== Cancellation Tests ====================

#[tokio::test]
async fn test_cancellation_never_commits_past_delivered_batch() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.add_serial_table("audit", 1..=500);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let armed = Arc::new(AtomicBool::new(false));
    let arm = armed.clone();
    let sink = MemorySink::new().on_emit(move |batch| {
        if arm.load(Ordering::SeqCst) && batch.table.name == "orders" && batch.sequence == 3 {
            trigger.cancel();
        }
    });
    let h = Harness::with_sink(&source, sink);
    let engine = h.engine(config(10).with_max_concurrent_tables(1)).await;

    engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(10)));
    let audit_before = h.watermark("audit").await;
    assert_eq!(audit_before, Some(Value::Int64(500)));

    armed.store(true, Ordering::SeqCst);
    source.insert_rows("orders", 11..=100);
    source.set_estimate("orders", Some(1));
    source.set_estimate("audit", Some(1_000));
    let report = engine.run(cancel).await.unwrap();

    // orders stopped after its third batch was delivered and committed
    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.status, TableStatus::Cancelled);
    assert_eq!(orders.rows, 30);
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(40)));
    assert_eq!(h.delivered_ids("orders"), (1..=40).collect::<Vec<_>>());

    // audit never started
    let audit = report.table(&tid("audit")).unwrap();
    assert_eq!(audit.status, TableStatus::Cancelled);
    assert_eq!(audit.rows, 0);
    assert_eq!(h.watermark("audit").await, audit_before);

    // the next run resumes exactly after the last committed batch
    let report = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.table(&tid("orders")).unwrap().rows, 60);
    assert_eq!(h.delivered_ids("orders"), (1..=100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cancelled_full_table_keeps_previous_checkpoint() {
    let source = MockSource::new();
    source.add_serial_table("events", 1..=50);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let sink = MemorySink::new().on_emit(move |batch| {
        if batch.sequence == 1 {
            trigger.cancel();
        }
    });
    let h = Harness::with_sink(&source, sink);
    let engine = h.engine(config(10)).await;

    let report = engine.run(cancel).await.unwrap();
    let events = report.table(&tid("events")).unwrap();
    assert_eq!(events.mode, ExtractionMode::Full);
    assert_eq!(events.status, TableStatus::Cancelled);
    assert_eq!(events.rows, 10);
    assert!(h.watermark("events").await.is_none());
}

#[tokio::test]
async fn test_cancel_before_run_starts_nothing() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    let h = Harness::new(&source);
    let engine = h.engine(config(10)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = engine.run(cancel).await.unwrap();
    assert!(report
        .tables
        .iter()
        .all(|t| t.status == TableStatus::Cancelled && t.rows == 0));
    assert!(h.sink.batches().is_empty());
}

// ==================== Failure Isolation Tests ====================

#[tokio::test]
async fn test_table_failure_does_not_fail_run() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.add_serial_table("locked", 1..=10);
    source.fail_queries("locked");
    let h = Harness::new(&source);
    let engine = h.engine(config(5)).await;

    let report = engine.run(CancellationToken::new()).await.unwrap();
    assert!(report.has_failures());

    let locked = report.table(&tid("locked")).unwrap();
    assert!(matches!(
        locked.status,
        TableStatus::Failed {
            category: ErrorCategory::Query,
            ..
        }
    ));
    assert!(h.watermark("locked").await.is_none());

    let orders = report.table(&tid("orders")).unwrap();
    assert_eq!(orders.status, TableStatus::Completed);
    assert_eq!(orders.rows, 10);
}

#[tokio::test]
async fn test_sink_rejection_keeps_last_acked_watermark() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    let h = Harness::with_sink(&source, MemorySink::new().fail_on(tid("orders"), 2));
    let engine = h.engine(config(10)).await;
    engine.run(CancellationToken::new()).await.unwrap();

    source.insert_rows("orders", 11..=40);
    let report = engine.run(CancellationToken::new()).await.unwrap();
    let orders = report.table(&tid("orders")).unwrap();
    assert!(matches!(
        orders.status,
        TableStatus::Failed {
            category: ErrorCategory::Sink,
            ..
        }
    ));
    assert_eq!(orders.rows, 10);
    assert_eq!(h.watermark("orders").await, Some(Value::Int64(20)));
}

#[tokio::test]
async fn test_introspection_failure_aborts_before_extraction() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.break_catalog(true);
    let h = Harness::new(&source);
    let engine = h.engine(config(10)).await;

    let err = engine.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Introspection);
    assert!(h.sink.batches().is_empty());
    assert!(h.snapshots.load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_source_unavailable_is_run_level() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.fail_connects(1);
    let h = Harness::new(&source);
    let engine = h.engine(config(10)).await;

    let err = engine.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::SourceUnavailable);
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_run_with_retry_recovers_from_unavailable_source() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.fail_connects(2);
    let h = Harness::new(&source);
    let mut cfg = config(10);
    cfg.run_retry = fast_retry(3);
    let engine = h.engine(cfg).await;

    let report = engine.run_with_retry(CancellationToken::new()).await.unwrap();
    assert_eq!(report.table(&tid("orders")).unwrap().rows, 10);
}

#[tokio::test]
async fn test_run_with_retry_gives_up() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.fail_connects(10);
    let h = Harness::new(&source);
    let mut cfg = config(10);
    cfg.run_retry = fast_retry(2);
    let engine = h.engine(cfg).await;

    let err = engine
        .run_with_retry(CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::SourceUnavailable);
}

// ==================== Concurrency Tests ====================

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let source = MockSource::new();
    for i in 0..6 {
        source.add_serial_table(&format!("t{}", i), 1..=5);
    }
    source.set_fetch_delay(Duration::from_millis(20));
    let h = Harness::new(&source);
    let engine = h.engine(config(10).with_max_concurrent_tables(2)).await;

    let report = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.tables.len(), 6);
    assert!(!report.has_failures());
    assert!(source.max_concurrent_queries() <= 2);
}

#[tokio::test]
async fn test_pool_exhaustion_is_retried() {
    let source = MockSource::new();
    for name in ["a", "b", "c"] {
        source.add_serial_table(name, 1..=5);
    }
    source.set_fetch_delay(Duration::from_millis(30));
    let h = Harness::new(&source);
    let cfg = config(10)
        .with_max_concurrent_tables(3)
        .with_pool_retry(RetryPolicy {
            max_retries: 50,
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            backoff_multiplier: 2.0,
        });
    let engine = h
        .engine_with(connection_config(1).with_acquire_timeout(10), cfg)
        .await;

    let report = engine.run(CancellationToken::new()).await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(report.total_rows(), 15);
}

#[tokio::test]
async fn test_pool_exhaustion_without_retry_fails_table() {
    let source = MockSource::new();
    source.add_serial_table("a", 1..=5);
    source.add_serial_table("b", 1..=5);
    source.set_fetch_delay(Duration::from_millis(300));
    let h = Harness::new(&source);
    let cfg = config(10)
        .with_max_concurrent_tables(2)
        .with_pool_retry(RetryPolicy::no_retry());
    let engine = h
        .engine_with(connection_config(1).with_acquire_timeout(10), cfg)
        .await;

    let report = engine.run(CancellationToken::new()).await.unwrap();
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        failed[0].status,
        TableStatus::Failed {
            category: ErrorCategory::PoolExhausted,
            ..
        }
    ));
}

// ==================== Ordering Tests ====================

#[tokio::test]
async fn test_tables_run_smallest_first() {
    let source = MockSource::new();
    source.add_serial_table("big", 1..=30);
    source.add_serial_table("small", 1..=3);
    source.add_serial_table("medium", 1..=10);
    let h = Harness::new(&source);
    let engine = h.engine(config(100).with_max_concurrent_tables(1)).await;

    let report = engine.run(CancellationToken::new()).await.unwrap();
    let order: Vec<&str> = report.tables.iter().map(|t| t.table.name.as_str()).collect();
    assert_eq!(order, vec!["small", "medium", "big"]);

    let delivered: Vec<String> = h
        .sink
        .batches()
        .iter()
        .map(|b| b.table.name.clone())
        .collect();
    assert_eq!(delivered, vec!["small", "medium", "big"]);
}
