//! cdmkg Core - Domain models, errors, and shared traits
//!
//! This crate defines the abstractions shared by every stage of the
//! milestone knowledge-graph pipeline:
//! - Segments of the source document
//! - Extracted triple candidates and persisted result rows
//! - Evaluation queries and context modes
//! - The common error taxonomy
//! - The LLM client trait
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, ConfigError, EvaluationConfig, ExtractionConfig, LlmConfig, LlmProvider,
    LoggingConfig, MatchMode, ReextractPolicy, RowFilter, SegmentationConfig, SegmentationMode,
};

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Error taxonomy for pipeline operations
#[derive(Error, Debug)]
pub enum KgError {
    /// An atomic unit could not fit under the length threshold. Non-fatal:
    /// the segment is emitted oversize and this is only logged/recorded.
    #[error("Segment {segment_id} is {length} chars, over the {threshold} char threshold")]
    SegmentationPolicyViolation {
        segment_id: usize,
        length: usize,
        threshold: usize,
    },

    /// Retryable failure of the external extraction capability
    #[error("Transient service error: {0}")]
    TransientService(String),

    /// The external capability returned something that is not a triple list
    #[error("Malformed extraction response: {0}")]
    ExtractionFormat(String),

    /// Retry budget exhausted for a segment
    #[error("Extraction failed for segment {segment_id} after {attempts} attempts: {last_error}")]
    ExtractionFailed {
        segment_id: usize,
        attempts: u32,
        last_error: String,
    },

    #[error("Segment {0} has already been extracted into the result table")]
    DuplicateSegment(usize),

    #[error("Segment {0} has annotated rows and cannot be overwritten")]
    AnnotatedSegment(usize),

    #[error("Malformed result table: {0}")]
    MalformedResultTable(String),

    #[error("Row not found: {0}")]
    RowNotFound(u64),

    #[error("Row {row_id} is already annotated as good={good}")]
    AlreadyAnnotated { row_id: u64, good: bool },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KgError {
    /// Whether the operation that produced this error may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientService(_))
    }

    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<ConfigError> for KgError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KgError>;

// ============================================================================
// Segments
// ============================================================================

/// A bounded, non-overlapping slice of the source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Sequence position, starting at 0
    pub id: usize,

    /// Byte offset of the first byte in the full text
    pub start: usize,

    /// Byte offset one past the last byte in the full text
    pub end: usize,

    /// Segment content, equal to `full_text[start..end]`
    pub text: String,
}

impl Segment {
    /// Create a segment covering `start..start + text.len()`
    pub fn new(id: usize, start: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id,
            start,
            end: start + text.len(),
            text,
        }
    }

    /// Byte range in the source text
    pub fn source_range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Length in characters
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Whether the segment has no content besides whitespace
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

// ============================================================================
// Triples
// ============================================================================

/// How an evidence span was located in its segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    /// Verbatim occurrence
    Exact,
    /// Occurrence after collapsing whitespace and ignoring case
    Fuzzy,
    /// Not found, or no evidence was reported
    #[default]
    Unaligned,
}

impl std::fmt::Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Fuzzy => write!(f, "fuzzy"),
            Self::Unaligned => write!(f, "unaligned"),
        }
    }
}

impl std::str::FromStr for Alignment {
    type Err = KgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "fuzzy" => Ok(Self::Fuzzy),
            "" | "unaligned" => Ok(Self::Unaligned),
            other => Err(KgError::MalformedResultTable(format!(
                "invalid alignment value: {other:?}"
            ))),
        }
    }
}

/// A structurally valid triple produced by the extractor, not yet stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripleCandidate {
    pub segment_id: usize,
    pub subject: String,
    pub predicate: String,
    pub object: String,

    /// Evidence span reported by the extractor, newlines flattened
    pub source_text: String,

    /// Byte range of the evidence in the full source text
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,

    pub alignment: Alignment,
}

impl TripleCandidate {
    pub fn new(
        segment_id: usize,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            segment_id,
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            source_text: String::new(),
            char_start: None,
            char_end: None,
            alignment: Alignment::Unaligned,
        }
    }

    /// Attach the evidence span
    pub fn with_source_text(mut self, source_text: impl Into<String>) -> Self {
        self.source_text = flatten_whitespace(&source_text.into());
        self
    }

    /// Record where the evidence was found; `None` leaves it unaligned
    pub fn with_alignment(mut self, alignment: Alignment, span: Option<Range<usize>>) -> Self {
        match span {
            Some(span) => {
                self.char_start = Some(span.start);
                self.char_end = Some(span.end);
                self.alignment = alignment;
            }
            None => {
                self.char_start = None;
                self.char_end = None;
                self.alignment = Alignment::Unaligned;
            }
        }
        self
    }
}

/// One row of the persisted result table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripleRow {
    /// Unique, stable identifier; strictly increasing in insertion order
    pub row_id: u64,

    pub segment_id: usize,
    pub subject: String,
    pub predicate: String,
    pub object: String,

    /// Manual correctness label; `None` until annotated
    pub good: Option<bool>,

    pub source_text: String,

    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
    pub alignment: Alignment,
}

impl TripleRow {
    /// Build a row from a candidate and its assigned id
    pub fn from_candidate(row_id: u64, candidate: TripleCandidate) -> Self {
        Self {
            row_id,
            segment_id: candidate.segment_id,
            subject: candidate.subject,
            predicate: candidate.predicate,
            object: candidate.object,
            good: None,
            source_text: candidate.source_text,
            char_start: candidate.char_start,
            char_end: candidate.char_end,
            alignment: candidate.alignment,
        }
    }

    /// Text used for lexical retrieval
    pub fn statement(&self) -> String {
        format!("{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// Collapse newlines and runs of whitespace into single spaces
pub fn flatten_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Evaluation Types
// ============================================================================

/// Size of the triple window handed to the evaluator per query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Narrow, targeted slice
    Short,
    /// Broad slice up to the whole table
    Long,
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Short => write!(f, "short"),
            Self::Long => write!(f, "long"),
        }
    }
}

impl std::str::FromStr for ContextMode {
    type Err = KgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "short" => Ok(Self::Short),
            "long" => Ok(Self::Long),
            other => Err(KgError::Config(format!("unknown context mode: {other}"))),
        }
    }
}

/// A question with its expected answer, evaluated under one context mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationQuery {
    pub question: String,
    pub expected_answer: String,
    pub context_mode: ContextMode,
}

impl EvaluationQuery {
    pub fn new(
        question: impl Into<String>,
        expected_answer: impl Into<String>,
        context_mode: ContextMode,
    ) -> Self {
        Self {
            question: question.into(),
            expected_answer: expected_answer.into(),
            context_mode,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Trait for LLM clients
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for a single prompt
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Model identifier, for logs and run reports
    fn model(&self) -> &str;
}

/// Single writer that receives extracted triples in segment order
pub trait TripleSink: Send {
    /// Whether a commit for `segment_id` would be accepted
    fn check_segment(&self, segment_id: usize) -> Result<()>;

    /// Append a segment's candidates, returning the row ids assigned
    fn commit(
        &mut self,
        segment_id: usize,
        candidates: Vec<TripleCandidate>,
    ) -> Result<Range<u64>>;

    /// Make committed rows durable
    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
