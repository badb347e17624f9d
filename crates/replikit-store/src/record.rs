//! Record-level storage operations shared by the backends.
//!
//! Each backend exposes raw reads and writes through [`RecordBackend`]; the
//! functions here turn those into the [`replikit::ReplicationStorage`]
//! operations so both backends agree on etag checks and conflict layout.

use replikit::{ConflictMarker, ConflictRecord, Etag, ExistingItem, Metadata, StoredPayload};

use crate::error::StoreError;

/// Raw record access within one open transaction.
pub(crate) trait RecordBackend {
    type Internal: Clone;

    fn read(&mut self, key: &str) -> Result<Option<ExistingItem<Self::Internal>>, StoreError>;

    /// Upsert `key`, assigning a fresh etag.
    fn write(
        &mut self,
        key: &str,
        payload: StoredPayload<Self::Internal>,
        metadata: Metadata,
    ) -> Result<Etag, StoreError>;

    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

fn check_etag<I>(
    key: &str,
    expected: Option<Etag>,
    current: Option<&ExistingItem<I>>,
) -> Result<(), StoreError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = current.map(|item| item.etag);
    if actual != Some(expected) {
        tracing::debug!(key, %expected, ?actual, "etag mismatch");
        return Err(StoreError::ConcurrencyConflict {
            key: key.to_owned(),
            expected,
            actual,
        });
    }
    Ok(())
}

pub(crate) fn add_without_conflict<B: RecordBackend>(
    backend: &mut B,
    key: &str,
    expected: Option<Etag>,
    metadata: &Metadata,
    payload: B::Internal,
) -> Result<Etag, StoreError> {
    let current = backend.read(key)?;
    check_etag(key, expected, current.as_ref())?;
    backend.write(key, StoredPayload::Data(payload), metadata.clone())
}

pub(crate) fn delete_item<B: RecordBackend>(
    backend: &mut B,
    key: &str,
    expected: Option<Etag>,
) -> Result<(), StoreError> {
    let current = backend.read(key)?;
    check_etag(key, expected, current.as_ref())?;
    if current.is_some() {
        backend.remove(key)?;
    }
    Ok(())
}

pub(crate) fn mark_as_deleted<B: RecordBackend>(
    backend: &mut B,
    key: &str,
    metadata: &Metadata,
) -> Result<Etag, StoreError> {
    let mut tombstone = metadata.clone();
    tombstone.deleted = true;
    backend.write(key, StoredPayload::Tombstone, tombstone)
}

pub(crate) fn create_conflict<B: RecordBackend>(
    backend: &mut B,
    key: &str,
    new_shadow: &str,
    existing_shadow: &str,
    existing: &ExistingItem<B::Internal>,
) -> Result<ConflictRecord, StoreError> {
    let payload = match &existing.payload {
        StoredPayload::Data(data) => StoredPayload::Data(data.clone()),
        StoredPayload::Tombstone => StoredPayload::Tombstone,
        StoredPayload::ConflictMarker(marker) => {
            return Err(StoreError::Conflicted {
                key: key.to_owned(),
                conflicts: marker.conflicts.clone(),
            })
        }
    };
    backend.write(existing_shadow, payload, existing.metadata.as_conflict_side())?;

    let marker = ConflictMarker::pair(existing_shadow, new_shadow);
    let etag = backend.write(
        key,
        StoredPayload::ConflictMarker(marker.clone()),
        Metadata::conflict_marker(&existing.metadata),
    )?;
    Ok(ConflictRecord {
        etag,
        conflicted_ids: marker.conflicts,
    })
}

pub(crate) fn append_to_conflict<B: RecordBackend>(
    backend: &mut B,
    key: &str,
    new_shadow: &str,
    existing: &ExistingItem<B::Internal>,
) -> Result<ConflictRecord, StoreError> {
    let Some(marker) = existing.marker() else {
        return Err(StoreError::NotConflicted {
            key: key.to_owned(),
        });
    };
    let mut marker = marker.clone();
    if !marker.push(new_shadow.to_owned()) {
        return Ok(ConflictRecord {
            etag: existing.etag,
            conflicted_ids: marker.conflicts,
        });
    }
    let etag = backend.write(
        key,
        StoredPayload::ConflictMarker(marker.clone()),
        existing.metadata.clone(),
    )?;
    Ok(ConflictRecord {
        etag,
        conflicted_ids: marker.conflicts,
    })
}
