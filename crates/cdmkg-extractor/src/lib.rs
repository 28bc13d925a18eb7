//! cdmkg Extractor - Triple extraction over document segments
//!
//! Sends each segment to an external extraction capability, validates the
//! returned triples and streams them, in segment order, into a
//! [`cdmkg_core::TripleSink`].

use cdmkg_core::Result;
use serde::{Deserialize, Serialize};

pub mod alignment;
pub mod extractor;
pub mod pipeline;
pub mod retry;
pub mod schema;
pub mod service;

pub use alignment::align;
pub use extractor::{SegmentExtraction, TripleExtractor};
pub use pipeline::{
    ExtractionPipeline, FailureKind, RunReport, SegmentFailure, SkippedSegment,
};
pub use retry::RetryPolicy;
pub use schema::{ExtractionSchema, FewShotExample, Predicate};
pub use service::LlmExtractionService;

/// A triple as returned by the extraction capability, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTriple {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub predicate: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub source_text: Option<String>,
}

impl RawTriple {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            source_text: None,
        }
    }

    pub fn with_source_text(mut self, source_text: impl Into<String>) -> Self {
        self.source_text = Some(source_text.into());
        self
    }
}

/// External capability that turns one text segment into raw triples
#[async_trait::async_trait]
pub trait ExtractionService: Send + Sync {
    /// Extract triples from `text` under `schema`
    ///
    /// Retryable failures must surface as `KgError::TransientService`;
    /// a response that cannot be read as a triple list as
    /// `KgError::ExtractionFormat`.
    async fn extract(&self, text: &str, schema: &ExtractionSchema) -> Result<Vec<RawTriple>>;

    /// Identifier used in logs and run reports
    fn name(&self) -> &str;
}
