//! End-to-end tests of the extraction pipeline with stub services

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdmkg_core::{KgError, ReextractPolicy, Result, Segment};
use cdmkg_extractor::{
    ExtractionPipeline, ExtractionSchema, ExtractionService, FailureKind, RawTriple,
    RetryPolicy, TripleExtractor,
};
use cdmkg_segmenter::{segment, SegmentationPolicy};
use cdmkg_table::{Aggregator, ResultTable};
use tokio_util::sync::CancellationToken;

/// Returns one triple named after the segment's first word group
struct OnePerSegment;

#[async_trait::async_trait]
impl ExtractionService for OnePerSegment {
    async fn extract(&self, text: &str, _schema: &ExtractionSchema) -> Result<Vec<RawTriple>> {
        let head = text.split(':').next().unwrap_or_default().trim().to_string();
        Ok(vec![RawTriple::new(head, "hasStakeholder", "ATC")])
    }

    fn name(&self) -> &str {
        "one-per-segment"
    }
}

/// Returns an empty subject for one segment
struct MalformedAt(&'static str);

#[async_trait::async_trait]
impl ExtractionService for MalformedAt {
    async fn extract(&self, text: &str, _schema: &ExtractionSchema) -> Result<Vec<RawTriple>> {
        let subject = if text.contains(self.0) { "" } else { "step" };
        Ok(vec![
            RawTriple::new("first", "hasNext", "second"),
            RawTriple::new(subject, "hasNext", "next step"),
        ])
    }

    fn name(&self) -> &str {
        "malformed"
    }
}

/// Fails transiently a fixed number of times per segment before answering
struct Flaky {
    failures_per_segment: usize,
    calls: std::sync::Mutex<HashMap<String, usize>>,
}

#[async_trait::async_trait]
impl ExtractionService for Flaky {
    async fn extract(&self, text: &str, _schema: &ExtractionSchema) -> Result<Vec<RawTriple>> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(text.to_string()).or_default();
            *count += 1;
            *count
        };
        if attempt <= self.failures_per_segment {
            return Err(KgError::TransientService("503 Service Unavailable".into()));
        }
        Ok(vec![RawTriple::new(text.trim(), "hasNext", "done")])
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Takes longer for earlier segments so that calls finish out of order
struct SlowFirst;

#[async_trait::async_trait]
impl ExtractionService for SlowFirst {
    async fn extract(&self, text: &str, _schema: &ExtractionSchema) -> Result<Vec<RawTriple>> {
        let n: u64 = text
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.trim_end_matches(':').parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(1000 - n * 50)).await;
        Ok((0..3)
            .map(|i| RawTriple::new(format!("m{n} step {i}"), "hasNext", "x"))
            .collect())
    }

    fn name(&self) -> &str {
        "slow-first"
    }
}

/// Counts calls and sleeps before answering
struct Sleepy {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ExtractionService for Sleepy {
    async fn extract(&self, _text: &str, _schema: &ExtractionSchema) -> Result<Vec<RawTriple>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(vec![RawTriple::new("s", "hasNext", "o")])
    }

    fn name(&self) -> &str {
        "sleepy"
    }
}

fn milestones(n: usize) -> Vec<Segment> {
    let text: String = (1..=n)
        .map(|i| format!("Milestone {i}: the aircraft completes step {i}.\n"))
        .collect();
    segment(&text, &SegmentationPolicy::milestones()).into_segments()
}

fn pipeline(service: Arc<dyn ExtractionService>) -> ExtractionPipeline {
    let extractor = TripleExtractor::new(service, ExtractionSchema::acdm())
        .with_retry(RetryPolicy::new(3, 100, 1000))
        .with_request_interval(Duration::ZERO);
    ExtractionPipeline::new(extractor)
}

#[tokio::test]
async fn test_one_row_per_milestone() {
    let segments = milestones(4);
    assert_eq!(segments.len(), 4);

    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let report = pipeline(Arc::new(OnePerSegment))
        .run(&segments, &mut agg, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.total_triples, 4);

    let rows = agg.table().rows();
    let ids: Vec<u64> = rows.iter().map(|r| r.row_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    for (row, segment) in rows.iter().zip(&segments) {
        assert_eq!(row.segment_id, segment.id);
        assert_eq!(row.subject, format!("Milestone {}", segment.id + 1));
    }
}

#[tokio::test]
async fn test_malformed_segment_does_not_abort_run() {
    let segments = milestones(5);

    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let report = pipeline(Arc::new(MalformedAt("Milestone 4:")))
        .run(&segments, &mut agg, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.successful_segments, 4);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].segment_id, 3);
    assert_eq!(report.failures[0].kind, FailureKind::MalformedResponse);

    // No partial rows from the failed segment
    let table = agg.table();
    assert_eq!(table.len(), 8);
    assert_eq!(table.rows_for_segment(3).count(), 0);
    assert!(table
        .rows()
        .iter()
        .all(|r| !r.subject.trim().is_empty() && !r.object.trim().is_empty()));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let segments = milestones(3);
    let service = Arc::new(Flaky {
        failures_per_segment: 2,
        calls: Default::default(),
    });

    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let report = pipeline(service)
        .run(&segments, &mut agg, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(agg.table().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_is_reported() {
    let segments = milestones(2);
    let service = Arc::new(Flaky {
        failures_per_segment: 10,
        calls: Default::default(),
    });

    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let report = pipeline(service)
        .run(&segments, &mut agg, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.successful_segments, 0);
    assert_eq!(report.failures.len(), 2);
    assert!(report
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::RetriesExhausted && f.attempts == Some(3)));
    assert!(agg.table().is_empty());
    assert!(!agg.is_processed(0));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_extraction_keeps_segment_order() {
    let segments = milestones(8);

    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let report = pipeline(Arc::new(SlowFirst))
        .with_concurrency(4)
        .run(&segments, &mut agg, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_complete());
    let rows = agg.table().rows();
    assert_eq!(rows.len(), 24);
    for pair in rows.windows(2) {
        assert!(pair[0].row_id < pair[1].row_id);
        assert!(pair[0].segment_id <= pair[1].segment_id);
    }
    assert_eq!(rows[0].subject, "m1 step 0");
    assert_eq!(rows[23].subject, "m8 step 2");
}

#[tokio::test]
async fn test_already_processed_segments_are_skipped() {
    let segments = milestones(3);
    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let pipeline = pipeline(Arc::new(OnePerSegment));

    pipeline
        .run(&segments[..2], &mut agg, &CancellationToken::new())
        .await
        .unwrap();
    let report = pipeline
        .run(&segments, &mut agg, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.successful_segments, 1);
    assert_eq!(agg.table().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_new_segments() {
    let segments = milestones(6);
    let service = Arc::new(Sleepy {
        delay: Duration::from_secs(10),
        calls: AtomicUsize::new(0),
    });
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        // Cancel while the second segment is in flight
        tokio::time::sleep(Duration::from_secs(15)).await;
        trigger.cancel();
    });

    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let report = pipeline(service.clone())
        .with_cancel_grace(Duration::from_secs(30))
        .run(&segments, &mut agg, &cancel)
        .await
        .unwrap();

    // The in-flight segment finishes within the grace period
    assert_eq!(report.successful_segments, 2);
    assert_eq!(report.cancelled, vec![2, 3, 4, 5]);
    assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    assert_eq!(agg.table().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_abandons_after_grace() {
    let segments = milestones(3);
    let service = Arc::new(Sleepy {
        delay: Duration::from_secs(120),
        calls: AtomicUsize::new(0),
    });
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
    let report = pipeline(service)
        .with_cancel_grace(Duration::from_secs(5))
        .run(&segments, &mut agg, &cancel)
        .await
        .unwrap();

    assert_eq!(report.successful_segments, 0);
    assert_eq!(report.cancelled, vec![0, 1, 2]);
    assert!(agg.table().is_empty());
}

#[tokio::test]
async fn test_rows_persisted_after_each_segment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("triples.csv");
    let segments = milestones(3);

    {
        let mut agg = Aggregator::open(&path, ReextractPolicy::Reject).unwrap();
        pipeline(Arc::new(MalformedAt("Milestone 2:")))
            .run(&segments, &mut agg, &CancellationToken::new())
            .await
            .unwrap();
    }

    let table = ResultTable::load(&path).unwrap();
    assert_eq!(table.len(), 4);
    let segment_ids: Vec<usize> = table.rows().iter().map(|r| r.segment_id).collect();
    assert_eq!(segment_ids, vec![0, 0, 2, 2]);

    // A retry run only touches the failed segment
    let mut agg = Aggregator::open(&path, ReextractPolicy::Reject).unwrap();
    let report = pipeline(Arc::new(OnePerSegment))
        .run(&segments, &mut agg, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(agg.table().rows_for_segment(1).count(), 1);
    assert_eq!(agg.table().max_row_id(), Some(4));
}
