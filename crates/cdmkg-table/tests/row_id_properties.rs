//! Property tests for row id allocation
//!
//! Whatever sequence of commits the aggregator sees, row ids stay unique
//! and strictly increasing, and a segment is never stored twice.

use std::collections::{BTreeMap, BTreeSet};

use cdmkg_core::{KgError, ReextractPolicy, TripleCandidate};
use cdmkg_table::{Aggregator, ResultTable};
use proptest::prelude::*;

fn candidates(segment_id: usize, n: usize) -> Vec<TripleCandidate> {
    (0..n)
        .map(|i| TripleCandidate::new(segment_id, format!("s{i}"), "hasNext", "o"))
        .collect()
}

fn policy() -> impl Strategy<Value = ReextractPolicy> {
    prop_oneof![Just(ReextractPolicy::Reject), Just(ReextractPolicy::Overwrite)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn ids_unique_and_increasing(
        commits in prop::collection::vec((0usize..6, 0usize..4), 0..30),
        policy in policy(),
    ) {
        let mut agg = Aggregator::in_memory(policy);
        let mut expected: BTreeMap<usize, usize> = BTreeMap::new();

        for (segment_id, n) in commits {
            match agg.commit(segment_id, candidates(segment_id, n)) {
                Ok(range) => {
                    prop_assert_eq!((range.end - range.start) as usize, n);
                    expected.insert(segment_id, n);
                }
                Err(KgError::DuplicateSegment(id)) => {
                    prop_assert_eq!(policy, ReextractPolicy::Reject);
                    prop_assert_eq!(id, segment_id);
                }
                Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {e}"))),
            }
        }

        let rows = agg.table().rows();
        for pair in rows.windows(2) {
            prop_assert!(pair[0].row_id < pair[1].row_id);
        }

        // Each segment holds exactly the rows of its accepted commit
        let mut actual: BTreeMap<usize, usize> = BTreeMap::new();
        for row in rows {
            *actual.entry(row.segment_id).or_default() += 1;
        }
        expected.retain(|_, n| *n > 0);
        prop_assert_eq!(actual, expected);

        // Round-trip through CSV keeps the invariant
        let reloaded = ResultTable::from_reader(agg.table().to_csv().unwrap().as_slice()).unwrap();
        prop_assert_eq!(reloaded.rows(), rows);
    }

    #[test]
    fn ids_never_reused_across_overwrites(rounds in prop::collection::vec(0usize..5, 1..20)) {
        let mut agg = Aggregator::in_memory(ReextractPolicy::Overwrite);
        let mut seen = BTreeSet::new();

        for n in rounds {
            let range = agg.commit(0, candidates(0, n)).unwrap();
            for id in range {
                prop_assert!(seen.insert(id), "row id {} reused", id);
            }
        }
    }
}
