//! Replication metadata carried by every stored item.
//!
//! The bag is flat: a handful of protocol fields plus arbitrary
//! application fields in [`Metadata::extra`], which the protocol never
//! interprets.

use std::collections::BTreeMap;
use std::fmt;

use crate::history::{History, ReplicationEntry};

/// Per-store write tag used for optimistic concurrency.
///
/// Every write to a store produces a new, strictly larger etag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Etag(pub u64);

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

/// Metadata of a replicated item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct Metadata {
    /// The item is a tombstone.
    #[cfg_attr(feature = "serde", serde(rename = "delete-marker"))]
    pub deleted: bool,
    /// Node that produced this exact version.
    #[cfg_attr(feature = "serde", serde(rename = "replication-source"))]
    pub source: Option<String>,
    /// Version counter scoped to `source`.
    #[cfg_attr(feature = "serde", serde(rename = "replication-version"))]
    pub version: Option<u64>,
    /// Lineage before `(source, version)`, oldest first.
    #[cfg_attr(feature = "serde", serde(rename = "replication-history"))]
    pub history: History,
    /// The key holds a conflict marker rather than item data.
    #[cfg_attr(feature = "serde", serde(rename = "replication-conflict"))]
    pub conflict: bool,
    /// The item is one side of a conflict, stored under a shadow key.
    #[cfg_attr(feature = "serde", serde(rename = "replication-conflict-document"))]
    pub conflict_document: bool,
    /// The history was produced by merging two tombstone lineages.
    #[cfg_attr(feature = "serde", serde(rename = "replication-merged-history"))]
    pub merged_history: bool,
    /// Logical grouping of the item (collection / entity name).
    pub collection: Option<String>,
    /// Application fields, carried verbatim.
    pub extra: BTreeMap<String, String>,
}

impl Metadata {
    /// Metadata for a write identified by `(source, version)` with an empty lineage.
    pub fn new(source: impl Into<String>, version: u64) -> Self {
        Self {
            source: Some(source.into()),
            version: Some(version),
            ..Self::default()
        }
    }

    /// Replace the lineage.
    #[must_use]
    pub fn with_history(mut self, history: impl Into<History>) -> Self {
        self.history = history.into();
        self
    }

    /// Mark as a tombstone.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Set the collection name.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Set an application field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The `(source, version)` pair identifying this write, if both are recorded.
    pub fn identity(&self) -> Option<ReplicationEntry> {
        match (&self.source, self.version) {
            (Some(source), Some(version)) => Some(ReplicationEntry::new(source.clone(), version)),
            _ => None,
        }
    }

    /// Whether both writes carry the same recorded identity.
    pub fn same_identity(&self, other: &Metadata) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Copy stamped as one side of a conflict, ready to be stored under a shadow key.
    pub fn as_conflict_side(&self) -> Self {
        let mut side = self.clone();
        side.conflict = true;
        side.conflict_document = true;
        side
    }

    /// Metadata of the marker that replaces `existing` when a conflict is first created.
    ///
    /// The marker carries no identity of its own; its lineage lives in the shadows.
    pub fn conflict_marker(existing: &Metadata) -> Self {
        Self {
            conflict: true,
            collection: existing.collection.clone(),
            extra: existing.extra.clone(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_source_and_version() {
        assert_eq!(
            Metadata::new("a", 3).identity(),
            Some(ReplicationEntry::new("a", 3))
        );

        let partial = Metadata {
            source: Some("a".into()),
            ..Metadata::default()
        };
        assert_eq!(partial.identity(), None);
        assert!(!partial.same_identity(&partial));
    }

    #[test]
    fn conflict_side_keeps_lineage() {
        let meta = Metadata::new("a", 2).with_history(vec![ReplicationEntry::new("a", 1)]);
        let side = meta.as_conflict_side();
        assert!(side.conflict && side.conflict_document);
        assert_eq!(side.history, meta.history);
        assert!(side.same_identity(&meta));
    }

    #[test]
    fn marker_drops_identity() {
        let meta = Metadata::new("a", 2).with_collection("users");
        let marker = Metadata::conflict_marker(&meta);
        assert!(marker.conflict);
        assert!(!marker.conflict_document);
        assert_eq!(marker.identity(), None);
        assert_eq!(marker.collection.as_deref(), Some("users"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_with_wire_names() {
        let meta = Metadata::new("node-a", 7).deleted();
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["delete-marker"], true);
        assert_eq!(json["replication-source"], "node-a");
        assert_eq!(json["replication-version"], 7);

        let back: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }
}
