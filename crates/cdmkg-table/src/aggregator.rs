//! Result aggregator
//!
//! The single writer of the result table. Assigns row ids in commit order,
//! enforces the re-extraction policy and persists the table together with a
//! JSON manifest so that id allocation and duplicate detection survive
//! restarts.

use std::collections::BTreeSet;
use std::ops::Range;
use std::path::{Path, PathBuf};

use cdmkg_core::{KgError, ReextractPolicy, Result, TripleCandidate, TripleRow, TripleSink};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{write_atomic, ResultTable};

/// Allocation state persisted next to the table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Next row id to hand out; ids are never reused
    pub next_row_id: u64,

    /// Segments committed so far, including those that yielded no triples
    pub processed_segments: BTreeSet<usize>,
}

impl Manifest {
    /// Manifest location for a table path: `triples.csv` -> `triples.manifest.json`
    pub fn path_for(table_path: &Path) -> PathBuf {
        table_path.with_extension("manifest.json")
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                KgError::MalformedResultTable(format!("manifest {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KgError::io(path, e)),
        }
    }

    /// State implied by the rows alone
    fn derive(table: &ResultTable) -> Self {
        Self {
            next_row_id: table.max_row_id().map_or(0, |id| id + 1),
            processed_segments: table.rows().iter().map(|r| r.segment_id).collect(),
        }
    }

    /// Merge a stored manifest with the table it describes
    fn reconcile(mut self, table: &ResultTable) -> Self {
        let derived = Self::derive(table);
        if derived.next_row_id > self.next_row_id {
            warn!(
                manifest = self.next_row_id,
                table = derived.next_row_id,
                "Manifest behind table, advancing next row id"
            );
            self.next_row_id = derived.next_row_id;
        }
        self.processed_segments.extend(derived.processed_segments);
        self
    }
}

/// Appends extracted triples to the result table
#[derive(Debug)]
pub struct Aggregator {
    path: Option<PathBuf>,
    table: ResultTable,
    manifest: Manifest,
    policy: ReextractPolicy,
}

impl Aggregator {
    /// Aggregator that is never persisted
    pub fn in_memory(policy: ReextractPolicy) -> Self {
        Self {
            path: None,
            table: ResultTable::new(),
            manifest: Manifest::default(),
            policy,
        }
    }

    /// Open the table at `path`, creating an empty one if it does not exist
    pub fn open(path: impl Into<PathBuf>, policy: ReextractPolicy) -> Result<Self> {
        let path = path.into();

        let table = if path.exists() {
            ResultTable::load(&path)?
        } else {
            ResultTable::new()
        };

        let manifest = match Manifest::load(&Manifest::path_for(&path))? {
            Some(manifest) => manifest.reconcile(&table),
            None => Manifest::derive(&table),
        };

        info!(
            path = %path.display(),
            rows = table.len(),
            processed_segments = manifest.processed_segments.len(),
            next_row_id = manifest.next_row_id,
            ?policy,
            "Result table opened"
        );

        Ok(Self {
            path: Some(path),
            table,
            manifest,
            policy,
        })
    }

    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn policy(&self) -> ReextractPolicy {
        self.policy
    }

    pub fn is_processed(&self, segment_id: usize) -> bool {
        self.manifest.processed_segments.contains(&segment_id)
    }

    /// Append a segment's candidates and return the ids they received
    pub fn commit(
        &mut self,
        segment_id: usize,
        candidates: Vec<TripleCandidate>,
    ) -> Result<Range<u64>> {
        self.check(segment_id)?;

        if self.is_processed(segment_id) {
            // Overwrite: the check above guarantees no annotated rows here
            let removed = self.table.remove_segment(segment_id);
            debug!(segment_id, removed, "Replacing previous rows");
        }

        let start = self.manifest.next_row_id;
        let end = start + candidates.len() as u64;
        let rows = self.table.rows_mut();
        for (row_id, candidate) in (start..end).zip(candidates) {
            debug_assert_eq!(candidate.segment_id, segment_id);
            rows.push(TripleRow::from_candidate(row_id, candidate));
        }

        self.manifest.next_row_id = end;
        self.manifest.processed_segments.insert(segment_id);

        Ok(start..end)
    }

    fn check(&self, segment_id: usize) -> Result<()> {
        if !self.is_processed(segment_id) {
            return Ok(());
        }
        match self.policy {
            ReextractPolicy::Reject => Err(KgError::DuplicateSegment(segment_id)),
            ReextractPolicy::Overwrite => {
                if self
                    .table
                    .rows_for_segment(segment_id)
                    .any(|row| row.good.is_some())
                {
                    Err(KgError::AnnotatedSegment(segment_id))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Persist table and manifest; a no-op for in-memory aggregators
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        self.table.save(path)?;

        let manifest_path = Manifest::path_for(path);
        let json = serde_json::to_vec_pretty(&self.manifest).map_err(|e| KgError::Other(e.into()))?;
        write_atomic(&manifest_path, &json)
    }
}

impl TripleSink for Aggregator {
    fn check_segment(&self, segment_id: usize) -> Result<()> {
        self.check(segment_id)
    }

    fn commit(
        &mut self,
        segment_id: usize,
        candidates: Vec<TripleCandidate>,
    ) -> Result<Range<u64>> {
        Aggregator::commit(self, segment_id, candidates)
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(segment_id: usize, n: usize) -> Vec<TripleCandidate> {
        (0..n)
            .map(|i| {
                TripleCandidate::new(segment_id, format!("s{segment_id}.{i}"), "hasNext", "o")
            })
            .collect()
    }

    #[test]
    fn test_ids_follow_commit_order() {
        let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);

        assert_eq!(agg.commit(0, candidates(0, 2)).unwrap(), 0..2);
        assert_eq!(agg.commit(1, vec![]).unwrap(), 2..2);
        assert_eq!(agg.commit(2, candidates(2, 3)).unwrap(), 2..5);

        let ids: Vec<u64> = agg.table().rows().iter().map(|r| r.row_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(agg.is_processed(1));
    }

    #[test]
    fn test_reject_duplicate_segment() {
        let mut agg = Aggregator::in_memory(ReextractPolicy::Reject);
        agg.commit(0, candidates(0, 2)).unwrap();

        let err = agg.commit(0, candidates(0, 2)).unwrap_err();
        assert!(matches!(err, KgError::DuplicateSegment(0)));
        assert_eq!(agg.table().len(), 2);

        // Segments that produced nothing are still duplicates
        agg.commit(1, vec![]).unwrap();
        assert!(agg.check_segment(1).is_err());
    }

    #[test]
    fn test_overwrite_replaces_with_fresh_ids() {
        let mut agg = Aggregator::in_memory(ReextractPolicy::Overwrite);
        agg.commit(0, candidates(0, 2)).unwrap();
        agg.commit(1, candidates(1, 1)).unwrap();

        let range = agg.commit(0, candidates(0, 3)).unwrap();
        assert_eq!(range, 3..6);

        let rows = agg.table().rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].segment_id, 1);
        assert_eq!(rows[0].row_id, 2);
        assert!(rows[1..].iter().all(|r| r.segment_id == 0));
        assert_eq!(agg.manifest().next_row_id, 6);
    }

    #[test]
    fn test_overwrite_refuses_annotated_segment() {
        let mut agg = Aggregator::in_memory(ReextractPolicy::Overwrite);
        agg.commit(0, candidates(0, 2)).unwrap();
        agg.table.annotate(1, true).unwrap();

        let err = agg.commit(0, candidates(0, 1)).unwrap_err();
        assert!(matches!(err, KgError::AnnotatedSegment(0)));
        assert_eq!(agg.table().len(), 2);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.csv");

        {
            let mut agg = Aggregator::open(&path, ReextractPolicy::Reject).unwrap();
            agg.commit(0, candidates(0, 2)).unwrap();
            agg.commit(1, vec![]).unwrap();
            agg.save().unwrap();
        }
        assert!(dir.path().join("triples.manifest.json").exists());

        let mut agg = Aggregator::open(&path, ReextractPolicy::Reject).unwrap();
        assert_eq!(agg.table().len(), 2);
        assert!(matches!(agg.check_segment(1), Err(KgError::DuplicateSegment(1))));
        assert_eq!(agg.commit(2, candidates(2, 1)).unwrap(), 2..3);
    }

    #[test]
    fn test_overwritten_ids_not_reused_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.csv");

        {
            let mut agg = Aggregator::open(&path, ReextractPolicy::Overwrite).unwrap();
            agg.commit(0, candidates(0, 1)).unwrap();
            agg.commit(1, candidates(1, 2)).unwrap();
            // Replace the rows holding the highest ids with nothing
            agg.commit(1, vec![]).unwrap();
            agg.save().unwrap();
        }

        let mut agg = Aggregator::open(&path, ReextractPolicy::Overwrite).unwrap();
        assert_eq!(agg.manifest().next_row_id, 3);
        assert_eq!(agg.commit(2, candidates(2, 1)).unwrap(), 3..4);
    }

    #[test]
    fn test_missing_manifest_is_derived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.csv");
        std::fs::write(
            &path,
            "row_id,segment_id,subject,predicate,object,good,source_text\n\
             0,0,a,hasNext,b,,\n\
             7,3,b,hasNext,c,true,\n",
        )
        .unwrap();

        let agg = Aggregator::open(&path, ReextractPolicy::Reject).unwrap();
        assert_eq!(agg.manifest().next_row_id, 8);
        assert!(agg.is_processed(3));
        assert!(!agg.is_processed(1));
    }

    #[test]
    fn test_checkpoint_keeps_hand_added_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.csv");
        std::fs::write(
            &path,
            "row_id,segment_id,subject,predicate,object,good,source_text,reviewer_note\n\
             0,0,a,hasNext,b,true,,check with ATC\n",
        )
        .unwrap();

        let mut agg = Aggregator::open(&path, ReextractPolicy::Reject).unwrap();
        agg.commit(1, candidates(1, 1)).unwrap();
        agg.checkpoint().unwrap();

        let table = ResultTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.extra_value(0, "reviewer_note"), Some("check with ATC"));
        assert_eq!(table.extra_value(1, "reviewer_note"), Some(""));
    }

    #[test]
    fn test_malformed_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.csv");
        std::fs::write(&path, "row_id,segment_id,subject,predicate,object\n1,0,a,p,b\n1,0,c,p,d\n")
            .unwrap();

        let err = Aggregator::open(&path, ReextractPolicy::Reject).unwrap_err();
        assert!(matches!(err, KgError::MalformedResultTable(_)));
    }
}
