//! Per-segment extraction: pacing, timeout, retry and validation

use std::sync::Arc;
use std::time::Duration;

use cdmkg_core::{Alignment, ExtractionConfig, KgError, Result, Segment, TripleCandidate};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::alignment::align;
use crate::retry::RetryPolicy;
use crate::schema::ExtractionSchema;
use crate::{ExtractionService, RawTriple};

// ============================================================================
// Pacer
// ============================================================================

/// Enforces a minimum interval between consecutive service calls
#[derive(Debug, Default)]
pub struct Pacer {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until the next call slot is free, then claim it
    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }

        // The lock is held across the sleep so that waiters queue up
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

// ============================================================================
// Segment Extraction
// ============================================================================

/// Validated triples of one segment, in the order the service produced them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentExtraction {
    pub segment_id: usize,
    candidates: Vec<TripleCandidate>,
}

impl SegmentExtraction {
    pub fn new(segment_id: usize, candidates: Vec<TripleCandidate>) -> Self {
        Self {
            segment_id,
            candidates,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TripleCandidate> {
        self.candidates.iter()
    }
}

impl IntoIterator for SegmentExtraction {
    type Item = TripleCandidate;
    type IntoIter = std::vec::IntoIter<TripleCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.into_iter()
    }
}

// ============================================================================
// Triple Extractor
// ============================================================================

/// Turns one segment into validated triple candidates
///
/// Holds no per-segment state; a single extractor is shared by all
/// in-flight segments of a run.
pub struct TripleExtractor {
    service: Arc<dyn ExtractionService>,
    schema: ExtractionSchema,
    retry: RetryPolicy,
    timeout: Duration,
    pacer: Pacer,
}

impl TripleExtractor {
    pub fn new(service: Arc<dyn ExtractionService>, schema: ExtractionSchema) -> Self {
        Self::with_config(service, schema, &ExtractionConfig::default())
    }

    pub fn with_config(
        service: Arc<dyn ExtractionService>,
        schema: ExtractionSchema,
        config: &ExtractionConfig,
    ) -> Self {
        Self {
            service,
            schema,
            retry: RetryPolicy::from_config(config),
            timeout: Duration::from_secs(config.request_timeout_secs),
            pacer: Pacer::new(Duration::from_millis(config.request_interval_ms)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.pacer = Pacer::new(interval);
        self
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    pub fn schema(&self) -> &ExtractionSchema {
        &self.schema
    }

    /// Extract and validate the triples of one segment
    pub async fn extract_segment(&self, segment: &Segment) -> Result<SegmentExtraction> {
        let raw = self
            .retry
            .retry(segment.id, || self.call_service(segment))
            .await?;

        let candidates = validate(segment, raw)?;
        tracing::debug!(
            segment_id = segment.id,
            triples = candidates.len(),
            "Segment extracted"
        );
        Ok(SegmentExtraction::new(segment.id, candidates))
    }

    async fn call_service(&self, segment: &Segment) -> Result<Vec<RawTriple>> {
        self.pacer.wait().await;

        match tokio::time::timeout(self.timeout, self.service.extract(&segment.text, &self.schema))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(KgError::TransientService(format!(
                "request timed out after {}s",
                self.timeout.as_secs_f32()
            ))),
        }
    }
}

/// Check the structural shape of every record and locate its evidence;
/// one bad record fails the segment
fn validate(segment: &Segment, raw: Vec<RawTriple>) -> Result<Vec<TripleCandidate>> {
    let segment_id = segment.id;
    raw.into_iter()
        .enumerate()
        .map(|(i, triple)| {
            let subject = triple.subject.trim();
            let predicate = triple.predicate.trim();
            let object = triple.object.trim();

            let missing = [("subject", subject), ("predicate", predicate), ("object", object)]
                .into_iter()
                .find(|(_, value)| value.is_empty());
            if let Some((field, _)) = missing {
                return Err(KgError::ExtractionFormat(format!(
                    "segment {segment_id}, record {i}: empty {field}"
                )));
            }

            let evidence = triple.source_text.unwrap_or_default();
            let (alignment, span) = align(segment, &evidence);
            if alignment == Alignment::Unaligned && !evidence.trim().is_empty() {
                tracing::debug!(segment_id, record = i, "Evidence not found in segment");
            }

            Ok(TripleCandidate::new(segment_id, subject, predicate, object)
                .with_source_text(evidence)
                .with_alignment(alignment, span))
        })
        .collect()
}
