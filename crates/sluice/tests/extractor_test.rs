//! Tests for batched row extraction

mod common;

use common::*;
use futures::StreamExt;
use proptest::prelude::*;
use sluice::prelude::*;
use std::time::Duration;

fn extractor(batch_size: usize) -> RowExtractor {
    RowExtractor::new(Arc::new(PostgresDialect), batch_size, Duration::from_secs(5))
}

fn orders_descriptor() -> TableDescriptor {
    TableDescriptor::new(tid("orders"), serial_columns())
        .unwrap()
        .with_incremental_key("id")
        .unwrap()
}

fn incremental_task(lower: i64) -> ExtractionTask {
    ExtractionTask {
        table: orders_descriptor(),
        mode: ExtractionMode::Incremental,
        lower_bound: Some(Value::Int64(lower)),
        watermark_column: Some("id".into()),
        reason: PlanReason::Resume,
    }
}

fn full_task() -> ExtractionTask {
    ExtractionTask {
        table: orders_descriptor(),
        mode: ExtractionMode::Full,
        lower_bound: None,
        watermark_column: Some("id".into()),
        reason: PlanReason::NoCheckpoint,
    }
}

async fn collect(
    extractor: &RowExtractor,
    source: &MockSource,
    task: &ExtractionTask,
) -> Vec<Result<RecordBatch>> {
    let conn = source.connection();
    extractor.extract(&conn, task).collect().await
}

fn ids(batches: &[RecordBatch]) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| b.rows.iter())
        .filter_map(|r| r.get_by_name("id").and_then(Value::as_i64))
        .collect()
}

// ==================== Incremental Tests ====================

#[tokio::test]
async fn test_resume_from_checkpoint_selects_rows_past_watermark() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=150);

    let batches: Vec<RecordBatch> = collect(&extractor(20), &source, &incremental_task(100))
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    let (sql, params) = source.queries_for("orders").pop().unwrap();
    assert!(sql.contains("\"id\" > $1"), "unexpected sql: {}", sql);
    assert!(sql.contains("ORDER BY \"id\" ASC"), "unexpected sql: {}", sql);
    assert_eq!(params, vec![Value::Int64(100)]);

    assert_eq!(ids(&batches), (101..=150).collect::<Vec<_>>());
    assert_eq!(
        batches.last().unwrap().watermark,
        Some(Value::Int64(150))
    );
}

#[tokio::test]
async fn test_batch_watermark_is_last_row_key() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=25);

    let batches: Vec<RecordBatch> = collect(&extractor(10), &source, &incremental_task(0))
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    let marks: Vec<Option<Value>> = batches.iter().map(|b| b.watermark.clone()).collect();
    assert_eq!(
        marks,
        vec![
            Some(Value::Int64(10)),
            Some(Value::Int64(20)),
            Some(Value::Int64(25))
        ]
    );
    let sequences: Vec<u64> = batches.iter().map(|b| b.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_nothing_past_watermark_yields_no_batches() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=50);

    let batches = collect(&extractor(10), &source, &incremental_task(50)).await;
    assert!(batches.is_empty());
}

#[tokio::test]
async fn test_lower_bound_is_bound_as_key_column_type() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=20);
    let mut task = incremental_task(0);
    task.lower_bound = Some(Value::Int32(15));

    let batches: Vec<RecordBatch> = collect(&extractor(10), &source, &task)
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(ids(&batches), (16..=20).collect::<Vec<_>>());

    let (_, params) = source.queries_for("orders").pop().unwrap();
    assert_eq!(params, vec![Value::Int64(15)]);
}

#[tokio::test]
async fn test_mismatched_bound_type_fails_query() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=20);
    let mut task = incremental_task(0);
    task.lower_bound = Some(Value::String("15".into()));

    let results = collect(&extractor(10), &source, &task).await;
    assert_eq!(results.len(), 1);
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Extraction);
    assert_eq!(err.root_cause().category(), ErrorCategory::Query);
}

#[test]
fn test_incremental_task_without_bound_is_rejected() {
    let mut task = incremental_task(0);
    task.lower_bound = None;
    let err = extractor(10).build_query(&task).unwrap_err();
    assert!(matches!(err, Error::Internal { .. }));
    assert_eq!(err.category(), ErrorCategory::Other);
}

// ==================== Full Extraction Tests ====================

#[tokio::test]
async fn test_full_extraction_has_no_filter() {
    let source = MockSource::new();
    source.add_serial_table("orders", (1..=30).rev());

    let batches: Vec<RecordBatch> = collect(&extractor(8), &source, &full_task())
        .await
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    let (sql, params) = source.queries_for("orders").pop().unwrap();
    assert!(!sql.contains("WHERE"));
    assert!(params.is_empty());
    assert_eq!(ids(&batches), (1..=30).collect::<Vec<_>>());
    assert_eq!(batches.last().unwrap().watermark, Some(Value::Int64(30)));
}

#[tokio::test]
async fn test_empty_table_yields_no_batches() {
    let source = MockSource::new();
    source.add_serial_table("orders", std::iter::empty());

    let batches = collect(&extractor(10), &source, &full_task()).await;
    assert!(batches.is_empty());
}

// ==================== Error Tests ====================

#[tokio::test]
async fn test_query_failure_is_reported_for_table() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.fail_queries("orders");

    let results = collect(&extractor(10), &source, &full_task()).await;
    assert_eq!(results.len(), 1);
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert!(matches!(err, Error::Extraction { ref table, .. } if *table == tid("orders")));
    assert_eq!(err.root_cause().category(), ErrorCategory::Query);
}

#[tokio::test]
async fn test_slow_query_times_out() {
    let source = MockSource::new();
    source.add_serial_table("orders", 1..=10);
    source.set_fetch_delay(Duration::from_millis(200));

    let extractor = RowExtractor::new(Arc::new(PostgresDialect), 10, Duration::from_millis(20));
    let results = collect(&extractor, &source, &full_task()).await;
    let err = results.into_iter().next().unwrap().unwrap_err();
    assert_eq!(err.root_cause().category(), ErrorCategory::Timeout);
}

// ==================== Batch Size Property Tests ====================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_batches_are_exactly_batch_size_except_last(rows in 0i64..200, batch in 1usize..40) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let source = MockSource::new();
        source.add_serial_table("orders", 1..=rows);

        let batches: Vec<RecordBatch> = rt
            .block_on(collect(&extractor(batch), &source, &full_task()))
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();

        let total: usize = batches.iter().map(RecordBatch::len).sum();
        prop_assert_eq!(total, rows as usize);
        prop_assert_eq!(batches.len(), (rows as usize).div_ceil(batch));
        if let Some((last, head)) = batches.split_last() {
            prop_assert!(head.iter().all(|b| b.len() == batch));
            prop_assert!(!last.is_empty() && last.len() <= batch);
        }
    }
}
