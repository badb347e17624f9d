//! The storage contract the intake protocol runs against.
//!
//! A [`ReplicationStorage`] value is bound to one open transaction of the
//! underlying store. The protocol never opens or commits transactions
//! itself; it reads and writes through this trait and registers deferred
//! work with [`ReplicationStorage::on_commit`].

use std::fmt;

use crate::metadata::{Etag, Metadata};

/// Kind of entity flowing through replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ItemKind {
    /// JSON-like documents.
    Document,
    /// Distributed counters.
    Counter,
    /// Binary file blobs.
    File,
}

impl ItemKind {
    /// Whether policy resolutions of this kind run the resolution triggers.
    ///
    /// Only documents go through the ordinary write pipeline that triggers
    /// hook into.
    pub fn fires_triggers(self) -> bool {
        matches!(self, Self::Document)
    }

    /// Lowercase tag used in notifications and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Counter => "counter",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The list of shadow keys stored at a conflicted primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConflictMarker {
    /// Shadow keys, in the order they joined the conflict.
    pub conflicts: Vec<String>,
}

impl ConflictMarker {
    /// Marker for a freshly detected conflict between two sides.
    pub fn pair(existing_shadow: impl Into<String>, new_shadow: impl Into<String>) -> Self {
        let mut marker = Self::default();
        marker.push(existing_shadow.into());
        marker.push(new_shadow.into());
        marker
    }

    /// Add a shadow key; already listed keys are not duplicated.
    ///
    /// Returns whether the list changed.
    pub fn push(&mut self, shadow: String) -> bool {
        if self.conflicts.contains(&shadow) {
            return false;
        }
        self.conflicts.push(shadow);
        true
    }

    /// Number of sides in conflict.
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// Whether no shadow is listed.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// What a stored key currently holds.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredPayload<I> {
    /// Ordinary item data.
    Data(I),
    /// A conflict marker listing shadow keys.
    ConflictMarker(ConflictMarker),
    /// A deleted item; only its metadata remains.
    Tombstone,
}

/// A record read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingItem<I> {
    /// Stored payload.
    pub payload: StoredPayload<I>,
    /// Etag of the stored record.
    pub etag: Etag,
    /// Stored metadata.
    pub metadata: Metadata,
}

impl<I> ExistingItem<I> {
    /// The record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.payload, StoredPayload::Tombstone) || self.metadata.deleted
    }

    /// The record is a conflict marker. Shadows are flagged as conflicted
    /// too but are not markers.
    pub fn is_conflict_marker(&self) -> bool {
        matches!(self.payload, StoredPayload::ConflictMarker(_))
            || (self.metadata.conflict && !self.metadata.conflict_document)
    }

    /// The item data, if the record holds any.
    pub fn data(&self) -> Option<&I> {
        match &self.payload {
            StoredPayload::Data(data) => Some(data),
            _ => None,
        }
    }

    /// The conflict marker, if the record is one.
    pub fn marker(&self) -> Option<&ConflictMarker> {
        match &self.payload {
            StoredPayload::ConflictMarker(marker) => Some(marker),
            _ => None,
        }
    }
}

/// A conflict as it stands after materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    /// Etag of the conflict marker.
    pub etag: Etag,
    /// Every shadow key participating in the conflict.
    pub conflicted_ids: Vec<String>,
}

/// Deferred action run once the surrounding transaction has committed.
pub type CommitAction = Box<dyn FnOnce() + Send + 'static>;

/// Storage operations required by the intake protocol, bound to one transaction.
///
/// `Internal` is the representation read back from storage; `External` is the
/// wire representation of incoming writes.
pub trait ReplicationStorage {
    /// Stored payload representation.
    type Internal;
    /// Incoming (wire) payload representation.
    type External;
    /// Storage error. Concurrency failures are reported through it.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Kind of entity this storage holds.
    fn item_kind(&self) -> ItemKind;

    /// Stable identifier of the local storage instance.
    ///
    /// Assigned once when the storage is created and kept across restarts.
    fn local_id(&self) -> &str;

    /// Read the current record at `key`, including tombstones and markers.
    fn try_get_existing(
        &mut self,
        key: &str,
    ) -> Result<Option<ExistingItem<Self::Internal>>, Self::Error>;

    /// Upsert `key`. When `expected_etag` is given, fail with a concurrency
    /// error unless the stored etag matches.
    fn add_without_conflict(
        &mut self,
        key: &str,
        expected_etag: Option<Etag>,
        metadata: &Metadata,
        payload: Self::External,
    ) -> Result<Etag, Self::Error>;

    /// Physically remove `key`, honoring the etag precondition.
    fn delete_item(&mut self, key: &str, expected_etag: Option<Etag>) -> Result<(), Self::Error>;

    /// Write a tombstone record carrying `metadata` at `key`.
    fn mark_as_deleted(&mut self, key: &str, metadata: &Metadata) -> Result<Etag, Self::Error>;

    /// Move `existing` to `existing_shadow_key` and replace `key` with a
    /// conflict marker listing `[existing_shadow_key, new_shadow_key]`.
    fn create_conflict(
        &mut self,
        key: &str,
        new_shadow_key: &str,
        existing_shadow_key: &str,
        existing: &ExistingItem<Self::Internal>,
    ) -> Result<ConflictRecord, Self::Error>;

    /// Add `new_shadow_key` to the conflict marker already stored at `key`.
    fn append_to_conflict(
        &mut self,
        key: &str,
        new_shadow_key: &str,
        existing: &ExistingItem<Self::Internal>,
    ) -> Result<ConflictRecord, Self::Error>;

    /// Register `action` to run after the transaction commits.
    ///
    /// Actions are dropped unrun if the transaction rolls back.
    fn on_commit(&mut self, action: CommitAction);
}
