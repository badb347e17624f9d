//! Property tests for the bounded lineage model.
//!
//! - appending and merging never exceed the bound
//! - the newest entries always survive eviction
//! - a write stamped on top of another descends from it, and not the reverse

use proptest::prelude::*;
use replikit::history::{self, Ancestry, History, ReplicationEntry};
use replikit::Metadata;

fn arb_entry() -> impl Strategy<Value = ReplicationEntry> {
    ("[a-e]", 1u64..40).prop_map(|(source, version)| ReplicationEntry::new(source, version))
}

fn arb_history() -> impl Strategy<Value = History> {
    prop::collection::vec(arb_entry(), 0..30).prop_map(History::from)
}

/// Lineages without repeated entries, as produced by correct peers.
fn arb_distinct_history() -> impl Strategy<Value = History> {
    prop::collection::btree_set(arb_entry(), 0..30)
        .prop_map(|entries| entries.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_append_is_bounded_and_keeps_newest(
        lineage in arb_history(),
        entry in arb_entry(),
        max in 1usize..20,
    ) {
        let next = history::append(&lineage, entry.clone(), max);

        prop_assert!(next.len() <= max);
        prop_assert_eq!(next.newest(), Some(&entry));

        let mut full = lineage.into_vec();
        full.push(entry);
        prop_assert_eq!(next.as_slice(), &full[full.len() - next.len()..]);
    }

    #[test]
    fn prop_merge_is_bounded_and_duplicate_free(
        incoming in arb_history(),
        existing in arb_history(),
        max in 1usize..20,
    ) {
        let merged = history::merge(&incoming, &existing, max);

        prop_assert!(merged.len() <= max);
        let mut sorted = merged.to_vec();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), merged.len());
    }

    #[test]
    fn prop_merge_retains_newest_incoming(
        incoming in arb_distinct_history(),
        existing in arb_history(),
        max in 1usize..20,
    ) {
        let merged = history::merge(&incoming, &existing, max);

        let start = incoming.len().saturating_sub(max);
        for entry in &incoming[start..] {
            prop_assert!(merged.contains_entry(entry), "lost {}", entry);
        }
        if let Some(newest) = incoming.newest() {
            prop_assert_eq!(merged.newest(), Some(newest));
        }
    }

    #[test]
    fn prop_merge_with_itself_only_bounds(lineage in arb_distinct_history(), max in 1usize..20) {
        let mut bounded = lineage.clone();
        bounded.bound(max);
        prop_assert_eq!(history::merge(&lineage, &lineage, max), bounded);
    }

    #[test]
    fn prop_stamped_writes_descend(
        lineage in arb_distinct_history(),
        source in "[a-e]",
        version in 1u64..40,
        max in 1usize..60,
    ) {
        let previous = Metadata::new(source, version).with_history(lineage);
        let next = history::stamp_local_write(Some(&previous), "local", 1, max);

        prop_assert!(next.history.len() <= max);
        prop_assert!(history::is_direct_descendant(&next, &previous));
        prop_assert_eq!(history::check_ancestry(&next, &previous), Ok(Ancestry::Descendant));
        prop_assert_eq!(history::check_ancestry(&previous, &next), Ok(Ancestry::Ancestor));
    }

    #[test]
    fn prop_unrelated_writes_are_concurrent(
        left in arb_distinct_history(),
        right in arb_distinct_history(),
    ) {
        // Identities from sources outside the generated alphabet never appear
        // in either lineage.
        let a = Metadata::new("x", 1).with_history(left);
        let b = Metadata::new("y", 1).with_history(right);
        prop_assert_eq!(history::ancestry(&a, &b), Ancestry::Concurrent);
        prop_assert_eq!(history::ancestry(&b, &a), Ancestry::Concurrent);
    }
}
