//! cdmkg Segmenter - Document segmentation
//!
//! Cuts the full converted text of the manual into a sequence of
//! non-overlapping segments that together cover the whole input.
//!
//! Two policies are supported:
//! - boundary markers (`Milestone N:`), one segment per marker block
//! - a length threshold, packing whole paragraphs greedily
//!
//! Atomic units (a marker block, a paragraph) are never split. A unit that
//! is longer than the threshold is emitted as an oversize segment and a
//! [`PolicyViolation`] is recorded.

pub mod loader;

pub use loader::{load_presegmented, read_source, write_segments, SegmentIndexEntry};

use std::ops::Range;

use cdmkg_core::{KgError, Result, Segment, SegmentationConfig, SegmentationMode};
use once_cell::sync::Lazy;
use regex::Regex;

static MILESTONE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bmilestone\s+\d+\s*:").expect("valid milestone marker"));

/// One or more blank lines
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)*").expect("valid paragraph break"));

// ============================================================================
// Policy
// ============================================================================

/// Segmentation policy
#[derive(Debug, Clone)]
pub enum SegmentationPolicy {
    /// A boundary at the start of every marker match; each block is atomic
    Markers {
        marker: Regex,
        /// Blocks longer than this are reported, never split
        max_chars: Option<usize>,
    },

    /// Paragraphs packed into segments of at most `max_chars` characters
    MaxLength { max_chars: usize },
}

impl SegmentationPolicy {
    /// Default policy: one segment per `Milestone N:` block
    pub fn milestones() -> Self {
        Self::Markers {
            marker: MILESTONE_MARKER.clone(),
            max_chars: None,
        }
    }

    /// Marker policy with a custom pattern
    pub fn markers(pattern: &str) -> Result<Self> {
        let marker = Regex::new(pattern)
            .map_err(|e| KgError::Config(format!("invalid marker pattern {pattern:?}: {e}")))?;
        Ok(Self::Markers {
            marker,
            max_chars: None,
        })
    }

    /// Length-threshold policy
    pub fn max_length(max_chars: usize) -> Self {
        Self::MaxLength { max_chars }
    }

    /// Set the length threshold
    pub fn with_max_chars(self, max: usize) -> Self {
        match self {
            Self::Markers { marker, .. } => Self::Markers {
                marker,
                max_chars: Some(max),
            },
            Self::MaxLength { .. } => Self::MaxLength { max_chars: max },
        }
    }

    /// Build from configuration
    pub fn from_config(config: &SegmentationConfig) -> Result<Self> {
        match config.mode {
            SegmentationMode::Markers => {
                let policy = Self::markers(&config.marker_pattern)?;
                Ok(match config.max_segment_chars {
                    Some(max) => policy.with_max_chars(max),
                    None => policy,
                })
            }
            SegmentationMode::MaxLength => {
                let max = config.max_segment_chars.ok_or_else(|| {
                    KgError::Config("max_length segmentation needs max_segment_chars".to_string())
                })?;
                Ok(Self::max_length(max))
            }
        }
    }

    /// Length threshold, if any
    pub fn threshold(&self) -> Option<usize> {
        match self {
            Self::Markers { max_chars, .. } => *max_chars,
            Self::MaxLength { max_chars } => Some(*max_chars),
        }
    }
}

impl Default for SegmentationPolicy {
    fn default() -> Self {
        Self::milestones()
    }
}

// ============================================================================
// Output
// ============================================================================

/// An atomic unit that did not fit under the threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub segment_id: usize,
    /// Segment length in characters
    pub length: usize,
    pub threshold: usize,
}

impl From<&PolicyViolation> for KgError {
    fn from(v: &PolicyViolation) -> Self {
        KgError::SegmentationPolicyViolation {
            segment_id: v.segment_id,
            length: v.length,
            threshold: v.threshold,
        }
    }
}

/// Result of segmenting a document
#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    /// Segments in id order
    pub segments: Vec<Segment>,

    /// Oversize segments, in id order
    pub violations: Vec<PolicyViolation>,
}

impl Segmentation {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Concatenate the segments in id order
    pub fn reconstruct(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Take ownership of the segments
    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }
}

// ============================================================================
// Segmentation
// ============================================================================

/// Segment a document according to `policy`
pub fn segment(text: &str, policy: &SegmentationPolicy) -> Segmentation {
    if text.is_empty() {
        return Segmentation::default();
    }

    let ranges = match policy {
        SegmentationPolicy::Markers { marker, .. } => marker_blocks(text, marker),
        SegmentationPolicy::MaxLength { max_chars } => {
            pack_units(text, paragraph_units(text), *max_chars)
        }
    };

    let threshold = policy.threshold();
    let mut result = Segmentation::default();

    for (id, range) in ranges.into_iter().enumerate() {
        let segment = Segment::new(id, range.start, &text[range]);

        if let Some(threshold) = threshold {
            let length = segment.char_len();
            if length > threshold {
                let violation = PolicyViolation {
                    segment_id: id,
                    length,
                    threshold,
                };
                tracing::warn!(
                    error = %KgError::from(&violation),
                    "Atomic unit kept whole above threshold"
                );
                result.violations.push(violation);
            }
        }

        result.segments.push(segment);
    }

    tracing::debug!(
        segments = result.segments.len(),
        oversize = result.violations.len(),
        "Document segmented"
    );

    result
}

/// Ranges between consecutive marker matches
fn marker_blocks(text: &str, marker: &Regex) -> Vec<Range<usize>> {
    let mut cuts: Vec<usize> = marker.find_iter(text).map(|m| m.start()).collect();
    cuts.dedup();

    match cuts.first().copied() {
        None => return vec![0..text.len()],
        Some(0) => {}
        // Whitespace before the first marker belongs to the first block
        Some(first) if text[..first].trim().is_empty() => cuts[0] = 0,
        // A real preamble is its own segment
        Some(_) => cuts.insert(0, 0),
    }

    let mut ranges: Vec<Range<usize>> = cuts.windows(2).map(|w| w[0]..w[1]).collect();
    if let Some(&last) = cuts.last() {
        ranges.push(last..text.len());
    }
    ranges.retain(|r| !r.is_empty());
    ranges
}

/// Paragraphs, each keeping the blank lines that follow it
fn paragraph_units(text: &str) -> Vec<Range<usize>> {
    let mut units = Vec::new();
    let mut start = 0;

    for m in PARAGRAPH_BREAK.find_iter(text) {
        units.push(start..m.end());
        start = m.end();
    }
    if start < text.len() {
        units.push(start..text.len());
    }

    units
}

/// Greedily merge adjacent units while the merged length stays under `max_chars`
fn pack_units(text: &str, units: Vec<Range<usize>>, max_chars: usize) -> Vec<Range<usize>> {
    let mut packed = Vec::new();
    let mut current: Option<Range<usize>> = None;
    let mut current_chars = 0;

    for unit in units {
        let unit_chars = text[unit.clone()].chars().count();

        if let Some(range) = current.as_mut() {
            if current_chars + unit_chars <= max_chars {
                range.end = unit.end;
                current_chars += unit_chars;
                continue;
            }
            packed.push(range.clone());
        }

        current = Some(unit);
        current_chars = unit_chars;
    }

    packed.extend(current);
    packed
}

// ============================================================================
// Tests
// ============================================================================
