//! Extraction pipeline
//!
//! Runs the extractor over a sequence of segments with a bounded number of
//! in-flight service calls. Results are handed to the sink strictly in
//! segment order, so the sink remains the single writer and row ids follow
//! extraction order regardless of which call finishes first.

use std::collections::HashSet;
use std::time::Duration;

use cdmkg_core::{ExtractionConfig, KgError, Result, Segment, TripleSink};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::extractor::{SegmentExtraction, TripleExtractor};

// ============================================================================
// Run Report
// ============================================================================

/// Why a segment produced no rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The service answered with something that is not a valid triple list
    MalformedResponse,
    /// Transient failures outlasted the retry budget
    RetriesExhausted,
    /// The sink refused the segment's rows
    Rejected,
    /// Any other permanent service error
    ServiceError,
}

impl FailureKind {
    fn classify(err: &KgError) -> Self {
        match err {
            KgError::ExtractionFormat(_) => Self::MalformedResponse,
            KgError::ExtractionFailed { .. } => Self::RetriesExhausted,
            KgError::DuplicateSegment(_) | KgError::AnnotatedSegment(_) => Self::Rejected,
            _ => Self::ServiceError,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::Rejected => write!(f, "rejected"),
            Self::ServiceError => write!(f, "service_error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFailure {
    pub segment_id: usize,
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    pub reason: String,
}

impl SegmentFailure {
    fn from_error(segment_id: usize, err: &KgError) -> Self {
        let attempts = match err {
            KgError::ExtractionFailed { attempts, .. } => Some(*attempts),
            _ => None,
        };
        Self {
            segment_id,
            kind: FailureKind::classify(err),
            attempts,
            reason: err.to_string(),
        }
    }
}

/// A segment that was not sent to the service at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedSegment {
    pub segment_id: usize,
    pub reason: String,
}

/// Outcome of one extraction run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub service: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_segments: usize,
    pub successful_segments: usize,
    pub total_triples: u64,
    pub failures: Vec<SegmentFailure>,
    pub skipped: Vec<SkippedSegment>,
    /// Segments left unprocessed because the run was cancelled
    pub cancelled: Vec<usize>,
}

impl RunReport {
    fn start(service: &str, total_segments: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            service: service.to_string(),
            started_at: now,
            finished_at: now,
            total_segments,
            successful_segments: 0,
            total_triples: 0,
            failures: Vec::new(),
            skipped: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    /// Every segment was extracted and committed
    pub fn is_complete(&self) -> bool {
        self.successful_segments == self.total_segments
    }

    pub fn was_cancelled(&self) -> bool {
        !self.cancelled.is_empty()
    }

    /// `KgError::Cancelled` if segments were left unprocessed
    pub fn check_cancelled(&self) -> Result<()> {
        if self.was_cancelled() {
            Err(KgError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Extraction run {} ({})", self.run_id, self.service)?;
        writeln!(
            f,
            "  segments: {} total, {} extracted, {} failed, {} skipped, {} cancelled",
            self.total_segments,
            self.successful_segments,
            self.failures.len(),
            self.skipped.len(),
            self.cancelled.len()
        )?;
        writeln!(f, "  triples:  {}", self.total_triples)?;
        writeln!(
            f,
            "  duration: {:.1}s",
            self.duration().num_milliseconds() as f64 / 1000.0
        )?;

        for failure in &self.failures {
            writeln!(
                f,
                "  failed segment {} [{}]: {}",
                failure.segment_id, failure.kind, failure.reason
            )?;
        }
        for skipped in &self.skipped {
            writeln!(
                f,
                "  skipped segment {}: {}",
                skipped.segment_id, skipped.reason
            )?;
        }
        if !self.cancelled.is_empty() {
            let ids: Vec<String> = self.cancelled.iter().map(|id| id.to_string()).collect();
            writeln!(f, "  cancelled segments: {}", ids.join(", "))?;
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Bounded, order-preserving extraction over many segments
pub struct ExtractionPipeline {
    extractor: TripleExtractor,
    concurrency: usize,
    cancel_grace: Duration,
}

impl ExtractionPipeline {
    pub fn new(extractor: TripleExtractor) -> Self {
        Self::from_config(extractor, &ExtractionConfig::default())
    }

    pub fn from_config(extractor: TripleExtractor, config: &ExtractionConfig) -> Self {
        Self {
            extractor,
            concurrency: config.concurrency.max(1),
            cancel_grace: Duration::from_secs(config.cancel_grace_secs),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn extractor(&self) -> &TripleExtractor {
        &self.extractor
    }

    /// Extract every segment and commit the results to `sink`
    ///
    /// Per-segment failures are recorded in the report and never abort the
    /// run. Only a failing `checkpoint` is fatal. On cancellation no new
    /// segment is started; calls already in flight get the grace period to
    /// finish and are committed if they do, otherwise they are abandoned.
    pub async fn run<S: TripleSink>(
        &self,
        segments: &[Segment],
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let mut report = RunReport::start(self.extractor.service_name(), segments.len());

        let mut pending = Vec::with_capacity(segments.len());
        for segment in segments {
            match sink.check_segment(segment.id) {
                Ok(()) => pending.push(segment),
                Err(e) => {
                    info!(segment_id = segment.id, reason = %e, "Skipping segment");
                    report.skipped.push(SkippedSegment {
                        segment_id: segment.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            run_id = %report.run_id,
            service = %report.service,
            segments = pending.len(),
            skipped = report.skipped.len(),
            concurrency = self.concurrency,
            "Starting extraction run"
        );

        let results = stream::iter(pending.iter().copied())
            .map(|segment| {
                let span = tracing::info_span!("segment", id = segment.id);
                async move {
                    if cancel.is_cancelled() {
                        return (segment.id, None);
                    }
                    (segment.id, Some(self.extractor.extract_segment(segment).await))
                }
                .instrument(span)
            })
            .buffered(self.concurrency);
        tokio::pin!(results);

        let mut handled = HashSet::with_capacity(pending.len());
        let mut deadline: Option<Instant> = None;

        loop {
            let grace_deadline = deadline;
            let next = match grace_deadline {
                None => tokio::select! {
                    item = results.next() => item,
                    _ = cancel.cancelled() => {
                        warn!(
                            grace_secs = self.cancel_grace.as_secs(),
                            "Cancellation requested, waiting for in-flight segments"
                        );
                        deadline = Some(Instant::now() + self.cancel_grace);
                        continue;
                    }
                },
                Some(deadline) => match tokio::time::timeout_at(deadline, results.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        warn!("Grace period elapsed, abandoning in-flight segments");
                        break;
                    }
                },
            };

            let Some((segment_id, outcome)) = next else {
                break;
            };

            match outcome {
                None => {}
                Some(Ok(extraction)) => {
                    handled.insert(segment_id);
                    self.commit(sink, extraction, &mut report)?;
                }
                Some(Err(e)) => {
                    handled.insert(segment_id);
                    warn!(segment_id, error = %e, "Segment extraction failed");
                    report.failures.push(SegmentFailure::from_error(segment_id, &e));
                }
            }
        }

        report.cancelled = pending
            .iter()
            .map(|segment| segment.id)
            .filter(|id| !handled.contains(id))
            .collect();
        report.finished_at = Utc::now();

        info!(
            run_id = %report.run_id,
            successful = report.successful_segments,
            failed = report.failures.len(),
            cancelled = report.cancelled.len(),
            triples = report.total_triples,
            "Extraction run finished"
        );

        Ok(report)
    }

    fn commit<S: TripleSink>(
        &self,
        sink: &mut S,
        extraction: SegmentExtraction,
        report: &mut RunReport,
    ) -> Result<()> {
        let segment_id = extraction.segment_id;

        match sink.commit(segment_id, extraction.into_iter().collect()) {
            Ok(row_ids) => {
                sink.checkpoint()?;
                report.successful_segments += 1;
                report.total_triples += row_ids.end - row_ids.start;
                info!(
                    segment_id,
                    rows = row_ids.end - row_ids.start,
                    first_row = row_ids.start,
                    "Segment committed"
                );
            }
            Err(e) => {
                warn!(segment_id, error = %e, "Sink rejected segment");
                report.failures.push(SegmentFailure::from_error(segment_id, &e));
            }
        }
        Ok(())
    }
}
