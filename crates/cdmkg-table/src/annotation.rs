//! Manual validation overlay
//!
//! Reviewers label rows `good = true/false` either by editing the CSV or
//! through [`ResultTable::annotate`]. A label, once set, is fixed.

use std::collections::BTreeMap;

use cdmkg_core::{KgError, Result, TripleRow};
use serde::{Deserialize, Serialize};

use crate::ResultTable;

impl ResultTable {
    /// Label a row; each row can be labelled exactly once
    pub fn annotate(&mut self, row_id: u64, good: bool) -> Result<()> {
        let index = self.position(row_id).ok_or(KgError::RowNotFound(row_id))?;
        let row = &mut self.rows_mut()[index];

        if let Some(existing) = row.good {
            return Err(KgError::AlreadyAnnotated {
                row_id,
                good: existing,
            });
        }

        row.good = Some(good);
        tracing::info!(row_id, good, "Row annotated");
        Ok(())
    }

    /// Rows still waiting for a label, in table order
    pub fn unlabelled(&self) -> impl Iterator<Item = &TripleRow> {
        self.rows().iter().filter(|r| r.good.is_none())
    }

    pub fn annotation_summary(&self) -> AnnotationSummary {
        AnnotationSummary::from_rows(self.rows())
    }
}

// ============================================================================
// Annotation Summary
// ============================================================================

/// Label counts for a group of rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub total: usize,
    pub good: usize,
    pub bad: usize,
}

impl LabelCounts {
    fn add(&mut self, good: Option<bool>) {
        self.total += 1;
        match good {
            Some(true) => self.good += 1,
            Some(false) => self.bad += 1,
            None => {}
        }
    }

    pub fn labelled(&self) -> usize {
        self.good + self.bad
    }

    pub fn unlabelled(&self) -> usize {
        self.total - self.labelled()
    }

    /// Share of labelled rows marked good; `None` when nothing is labelled
    pub fn precision(&self) -> Option<f64> {
        match self.labelled() {
            0 => None,
            n => Some(self.good as f64 / n as f64),
        }
    }
}

/// Annotation progress and extraction precision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSummary {
    pub overall: LabelCounts,
    pub by_predicate: BTreeMap<String, LabelCounts>,
    pub by_segment: BTreeMap<usize, LabelCounts>,
}

impl AnnotationSummary {
    pub fn from_rows(rows: &[TripleRow]) -> Self {
        let mut summary = Self::default();
        for row in rows {
            summary.overall.add(row.good);
            summary
                .by_predicate
                .entry(row.predicate.clone())
                .or_default()
                .add(row.good);
            summary
                .by_segment
                .entry(row.segment_id)
                .or_default()
                .add(row.good);
        }
        summary
    }

    /// Fraction of rows carrying a label
    pub fn coverage(&self) -> f64 {
        if self.overall.total == 0 {
            0.0
        } else {
            self.overall.labelled() as f64 / self.overall.total as f64
        }
    }
}

fn format_precision(counts: &LabelCounts) -> String {
    counts
        .precision()
        .map(|p| format!("{:.1}%", p * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

impl std::fmt::Display for AnnotationSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "rows: {} ({} labelled, {} unlabelled, coverage {:.1}%)",
            self.overall.total,
            self.overall.labelled(),
            self.overall.unlabelled(),
            self.coverage() * 100.0
        )?;
        writeln!(
            f,
            "precision: {} ({} good / {} bad)",
            format_precision(&self.overall),
            self.overall.good,
            self.overall.bad
        )?;

        writeln!(f, "by predicate:")?;
        for (predicate, counts) in &self.by_predicate {
            writeln!(
                f,
                "  {:<16} {:>5} rows  precision {}",
                predicate,
                counts.total,
                format_precision(counts)
            )?;
        }

        writeln!(f, "by segment:")?;
        for (segment_id, counts) in &self.by_segment {
            writeln!(
                f,
                "  {:<16} {:>5} rows  precision {}",
                segment_id,
                counts.total,
                format_precision(counts)
            )?;
        }
        Ok(())
    }
}
