//! Entity kinds: how each kind's payloads are represented and stored.
//!
//! The replication protocol is polymorphic over a stored (`Internal`) and an
//! incoming (`External`) payload. An [`EntityKind`] fixes both for one kind
//! and tells the backends how to persist the stored form.

use std::collections::BTreeMap;

use replikit::resolver::descend_from_both;
use replikit::{BoxError, ConflictResolver, ExistingItem, ItemKind, Metadata, Resolution};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Payload representations of one entity kind.
pub trait EntityKind: Send + Sync + 'static {
    /// Stored representation.
    type Internal: Clone + Send + 'static;
    /// Incoming (wire) representation.
    type External: Send + 'static;

    /// Tag reported in notifications.
    const KIND: ItemKind;

    /// Convert an incoming payload to its stored form.
    fn internalize(external: Self::External) -> Self::Internal;

    /// Serialize the stored form for persistent backends.
    fn encode(internal: &Self::Internal) -> Result<Vec<u8>, StoreError>;

    /// Deserialize the stored form.
    fn decode(bytes: &[u8]) -> Result<Self::Internal, StoreError>;
}

/// JSON documents. Stored and wire forms are the same value.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentKind;

impl EntityKind for DocumentKind {
    type Internal = serde_json::Value;
    type External = serde_json::Value;

    const KIND: ItemKind = ItemKind::Document;

    fn internalize(external: serde_json::Value) -> serde_json::Value {
        external
    }

    fn encode(internal: &serde_json::Value) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(internal).map_err(|e| StoreError::encode("document", e))
    }

    fn decode(bytes: &[u8]) -> Result<serde_json::Value, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::decode("document", e))
    }
}

/// A replicated positive-negative counter.
///
/// Each node only ever raises its own totals; the value is the sum of
/// increments minus the sum of decrements across nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    increments: BTreeMap<String, u64>,
    decrements: BTreeMap<String, u64>,
}

impl Counter {
    /// Zero counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` on behalf of `node`. Per-node totals saturate at `u64::MAX`.
    pub fn increment(&mut self, node: &str, n: u64) {
        let total = self.increments.entry(node.to_owned()).or_insert(0);
        *total = total.saturating_add(n);
    }

    /// Subtract `n` on behalf of `node`. Per-node totals saturate at `u64::MAX`.
    pub fn decrement(&mut self, node: &str, n: u64) {
        let total = self.decrements.entry(node.to_owned()).or_insert(0);
        *total = total.saturating_add(n);
    }

    /// Current value, clamped to the `i64` range.
    #[must_use]
    pub fn value(&self) -> i64 {
        let sum = |totals: &BTreeMap<String, u64>| -> i128 {
            totals.values().map(|&n| i128::from(n)).sum()
        };
        let value = sum(&self.increments) - sum(&self.decrements);
        i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
    }

    /// Fold in another replica's totals, keeping the maximum per node.
    pub fn merge(&mut self, other: &Counter) {
        for (node, &n) in &other.increments {
            let entry = self.increments.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(n);
        }
        for (node, &n) in &other.decrements {
            let entry = self.decrements.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(n);
        }
    }
}

/// Wire form of a counter: per-node totals as seen by the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterUpdate {
    /// Increment totals per node.
    pub increments: BTreeMap<String, u64>,
    /// Decrement totals per node.
    pub decrements: BTreeMap<String, u64>,
}

impl From<Counter> for CounterUpdate {
    fn from(counter: Counter) -> Self {
        Self {
            increments: counter.increments,
            decrements: counter.decrements,
        }
    }
}

impl From<CounterUpdate> for Counter {
    fn from(update: CounterUpdate) -> Self {
        Self {
            increments: update.increments,
            decrements: update.decrements,
        }
    }
}

/// Distributed counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterKind;

impl EntityKind for CounterKind {
    type Internal = Counter;
    type External = CounterUpdate;

    const KIND: ItemKind = ItemKind::Counter;

    fn internalize(external: CounterUpdate) -> Counter {
        external.into()
    }

    fn encode(internal: &Counter) -> Result<Vec<u8>, StoreError> {
        postcard::to_allocvec(internal).map_err(|e| StoreError::encode("counter", e))
    }

    fn decode(bytes: &[u8]) -> Result<Counter, StoreError> {
        postcard::from_bytes(bytes).map_err(|e| StoreError::decode("counter", e))
    }
}

/// Resolves counter conflicts by merging both sides' totals.
///
/// Deletes and tombstones are not merged; those conflicts are declined.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterMergeResolver;

impl ConflictResolver<Counter, CounterUpdate> for CounterMergeResolver {
    fn try_resolve(
        &self,
        _key: &str,
        incoming: &Metadata,
        incoming_payload: Option<&CounterUpdate>,
        existing: &ExistingItem<Counter>,
    ) -> Result<Option<Resolution<CounterUpdate>>, BoxError> {
        let (Some(update), Some(local)) = (incoming_payload, existing.data()) else {
            return Ok(None);
        };
        let mut merged = local.clone();
        merged.merge(&Counter::from(update.clone()));
        Ok(Some(Resolution::Keep {
            metadata: descend_from_both(incoming, &existing.metadata),
            payload: merged.into(),
        }))
    }
}

/// A stored file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlob {
    content: Vec<u8>,
}

impl FileBlob {
    /// File contents.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl From<FileBlob> for Vec<u8> {
    fn from(blob: FileBlob) -> Self {
        blob.content
    }
}

/// Binary files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileKind;

impl EntityKind for FileKind {
    type Internal = FileBlob;
    type External = Vec<u8>;

    const KIND: ItemKind = ItemKind::File;

    fn internalize(external: Vec<u8>) -> FileBlob {
        FileBlob { content: external }
    }

    fn encode(internal: &FileBlob) -> Result<Vec<u8>, StoreError> {
        postcard::to_allocvec(internal).map_err(|e| StoreError::encode("file", e))
    }

    fn decode(bytes: &[u8]) -> Result<FileBlob, StoreError> {
        postcard::from_bytes(bytes).map_err(|e| StoreError::decode("file", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replikit::{Etag, ReplicationEntry, StoredPayload};

    #[test]
    fn large_counter_totals_do_not_wrap() {
        let mut c = Counter::new();
        c.increment("a", u64::MAX);
        c.increment("a", 1);
        c.increment("b", u64::MAX);
        assert_eq!(c.value(), i64::MAX);

        c.decrement("c", u64::MAX);
        c.decrement("d", u64::MAX);
        c.decrement("e", u64::MAX);
        assert_eq!(c.value(), i64::MIN);

        let mut small = Counter::new();
        small.increment("a", u64::MAX);
        small.decrement("b", u64::MAX - 7);
        assert_eq!(small.value(), 7);
    }

    #[test]
    fn counter_value_and_merge() {
        let mut a = Counter::new();
        a.increment("a", 5);
        a.decrement("a", 2);

        let mut b = Counter::new();
        b.increment("b", 4);
        b.increment("a", 3);

        a.merge(&b);
        assert_eq!(a.value(), 5 + 4 - 2);

        let before = a.clone();
        a.merge(&b);
        assert_eq!(a, before);
    }

    #[test]
    fn counter_round_trips_through_postcard() {
        let mut c = Counter::new();
        c.increment("n1", 7);
        c.decrement("n2", 1);
        let bytes = CounterKind::encode(&c).unwrap();
        assert_eq!(CounterKind::decode(&bytes).unwrap(), c);
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        assert!(matches!(
            DocumentKind::decode(b"{not json"),
            Err(StoreError::Decode { what: "document", .. })
        ));
    }

    #[test]
    fn counter_resolver_merges_both_sides() {
        let mut local = Counter::new();
        local.increment("a", 2);
        let existing = ExistingItem {
            payload: StoredPayload::Data(local),
            etag: Etag(3),
            metadata: Metadata::new("a", 2),
        };

        let mut remote = Counter::new();
        remote.increment("b", 5);
        let incoming = Metadata::new("b", 1);

        let resolution = CounterMergeResolver
            .try_resolve("hits", &incoming, Some(&remote.into()), &existing)
            .unwrap()
            .unwrap();
        let Resolution::Keep { metadata, payload } = resolution else {
            panic!("expected merged counter");
        };
        assert_eq!(Counter::from(payload).value(), 7);
        assert!(metadata.history.contains_entry(&ReplicationEntry::new("a", 2)));
    }

    #[test]
    fn counter_resolver_declines_deletes() {
        let existing = ExistingItem {
            payload: StoredPayload::Data(Counter::new()),
            etag: Etag(1),
            metadata: Metadata::new("a", 1),
        };
        let out = CounterMergeResolver
            .try_resolve("hits", &Metadata::new("b", 1).deleted(), None, &existing)
            .unwrap();
        assert!(out.is_none());
    }
}
