//! Version history model.
//!
//! Every write is identified by the `(source, version)` pair of the node that
//! produced it. An item's metadata carries a bounded, append-only lineage of
//! the pairs that preceded the current one; the lineage is what lets a
//! receiving node decide whether an incoming write causally descends from
//! what it already stores.
//!
//! The lineage is bounded to `max` entries and evicts oldest-first (FIFO).
//! Entries are never reordered.
//!
//! # Example
//!
//! ```
//! use replikit::history::{self, ReplicationEntry};
//! use replikit::Metadata;
//!
//! let a1 = Metadata::new("a", 1);
//! let b1 = history::stamp_local_write(Some(&a1), "b", 1, 50);
//!
//! assert_eq!(b1.history.as_slice(), &[ReplicationEntry::new("a", 1)]);
//! assert!(history::is_direct_descendant(&b1, &a1));
//! assert!(!history::is_direct_descendant(&a1, &b1));
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;

use crate::error::CausalityViolation;
use crate::metadata::Metadata;

/// Default bound on the lineage length.
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// One `(source, version)` lineage entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplicationEntry {
    /// Node that produced the write.
    pub source: String,
    /// Version counter scoped to `source`.
    pub version: u64,
}

impl ReplicationEntry {
    /// Create an entry.
    pub fn new(source: impl Into<String>, version: u64) -> Self {
        Self {
            source: source.into(),
            version,
        }
    }
}

impl fmt::Display for ReplicationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.version)
    }
}

/// Ordered lineage, oldest entry first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct History(Vec<ReplicationEntry>);

impl History {
    /// Empty lineage.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Entries, oldest first.
    pub fn as_slice(&self) -> &[ReplicationEntry] {
        &self.0
    }

    /// The most recently appended entry.
    pub fn newest(&self) -> Option<&ReplicationEntry> {
        self.0.last()
    }

    /// Whether `entry` was recorded as an ancestor.
    pub fn contains_entry(&self, entry: &ReplicationEntry) -> bool {
        self.0.contains(entry)
    }

    /// Whether the lineage already includes `entry` or a later version from
    /// the same source.
    ///
    /// Versions are monotonic per source, so a recorded later version implies
    /// the earlier write has been seen.
    pub fn covers(&self, entry: &ReplicationEntry) -> bool {
        self.0
            .iter()
            .any(|e| e.source == entry.source && e.version >= entry.version)
    }

    /// Consume into the backing vector.
    pub fn into_vec(self) -> Vec<ReplicationEntry> {
        self.0
    }

    /// Evict the oldest entries until at most `max` remain.
    pub fn bound(&mut self, max: usize) {
        if self.0.len() > max {
            let excess = self.0.len() - max;
            self.0.drain(..excess);
        }
    }
}

impl Deref for History {
    type Target = [ReplicationEntry];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<ReplicationEntry>> for History {
    fn from(entries: Vec<ReplicationEntry>) -> Self {
        Self(entries)
    }
}

impl FromIterator<ReplicationEntry> for History {
    fn from_iter<T: IntoIterator<Item = ReplicationEntry>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a ReplicationEntry;
    type IntoIter = std::slice::Iter<'a, ReplicationEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The lineage stored in `metadata` (empty when none was recorded).
pub fn history(metadata: &Metadata) -> &History {
    &metadata.history
}

/// Append `entry`, evicting the oldest entries until at most `max` remain.
pub fn append(history: &History, entry: ReplicationEntry, max: usize) -> History {
    let mut next = history.clone();
    next.0.push(entry);
    next.bound(max);
    next
}

/// Union two lineages, deduplicated, bounded to `max`.
///
/// `incoming` is first truncated to its newest `max` entries. Entries only
/// known to `existing` are treated as older than everything in `incoming`,
/// so eviction drops them first.
pub fn merge(incoming: &History, existing: &History, max: usize) -> History {
    let start = incoming.len().saturating_sub(max);
    let newest = &incoming.0[start..];

    let mut seen: BTreeSet<&ReplicationEntry> = newest.iter().collect();
    let mut merged = Vec::with_capacity(existing.len() + newest.len());
    for entry in existing {
        if seen.insert(entry) {
            merged.push(entry.clone());
        }
    }

    let mut emitted = BTreeSet::new();
    for entry in newest {
        if emitted.insert(entry) {
            merged.push(entry.clone());
        }
    }

    let mut merged = History(merged);
    merged.bound(max);
    merged
}

/// Whether `incoming` may overwrite `existing` without a conflict.
///
/// True iff the two writes have different identities and either `existing`
/// carries no identity yet, or its identity was recorded in `incoming`'s
/// lineage when `incoming` was produced.
pub fn is_direct_descendant(incoming: &Metadata, existing: &Metadata) -> bool {
    match existing.identity() {
        None => true,
        Some(current) => {
            incoming.identity().as_ref() != Some(&current)
                && incoming.history.contains_entry(&current)
        }
    }
}

/// Causal relation of an incoming write to the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ancestry {
    /// Both carry the same identity.
    Same,
    /// Incoming descends from existing.
    Descendant,
    /// Existing already descends from incoming.
    Ancestor,
    /// Neither lineage contains the other.
    Concurrent,
}

/// Classify `incoming` against `existing` without checking for violations.
///
/// When each lineage contains the other's identity the result is
/// [`Ancestry::Descendant`]; use [`check_ancestry`] to reject that case.
pub fn ancestry(incoming: &Metadata, existing: &Metadata) -> Ancestry {
    classify(incoming, existing).0
}

/// Classify `incoming` against `existing`, failing when both lineages
/// contain each other's identity.
///
/// Versions are monotonic per source, so mutual ancestry means some node
/// reused a version. There is no safe side to pick.
pub fn check_ancestry(
    incoming: &Metadata,
    existing: &Metadata,
) -> Result<Ancestry, CausalityViolation> {
    match classify(incoming, existing) {
        (_, Some(violation)) => Err(violation),
        (ancestry, None) => Ok(ancestry),
    }
}

fn classify(incoming: &Metadata, existing: &Metadata) -> (Ancestry, Option<CausalityViolation>) {
    if incoming.same_identity(existing) {
        return (Ancestry::Same, None);
    }

    let downstream = is_direct_descendant(incoming, existing);
    let upstream = incoming
        .identity()
        .is_some_and(|id| existing.history.contains_entry(&id));

    match (existing.identity(), incoming.identity()) {
        (None, _) if upstream => (Ancestry::Ancestor, None),
        (None, _) => (Ancestry::Descendant, None),
        (Some(current), Some(id)) if downstream && upstream => (
            Ancestry::Descendant,
            Some(CausalityViolation {
                incoming: id,
                existing: current,
            }),
        ),
        _ if downstream => (Ancestry::Descendant, None),
        _ if upstream => (Ancestry::Ancestor, None),
        _ => (Ancestry::Concurrent, None),
    }
}

/// Metadata for a write originated locally on top of `previous`.
///
/// The previous identity moves into the lineage, which stays bounded to `max`.
pub fn stamp_local_write(
    previous: Option<&Metadata>,
    local_id: &str,
    version: u64,
    max: usize,
) -> Metadata {
    let mut metadata = Metadata::new(local_id, version);
    if let Some(previous) = previous {
        metadata.history = match previous.identity() {
            Some(id) => append(&previous.history, id, max),
            None => {
                let mut lineage = previous.history.clone();
                lineage.bound(max);
                lineage
            }
        };
        metadata.collection.clone_from(&previous.collection);
    }
    metadata
}
