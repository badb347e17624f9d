//! Writes originated on this node.
//!
//! Local writes stamp fresh `(local id, version)` identities and push the
//! previous identity into the lineage, so peers receiving them recognize
//! them as descendants. Writing over a conflicted key is refused except
//! through [`resolve_local`].

use replikit::history::{self, History};
use replikit::{ExistingItem, Metadata, ReplicationConfig, ReplicationStorage};

use crate::error::StoreError;
use crate::traits::{ExternalOf, LocalVersions, Transactional};

fn refuse_conflicted<I>(key: &str, existing: Option<&ExistingItem<I>>) -> Result<(), StoreError> {
    match existing.and_then(ExistingItem::marker) {
        Some(marker) => Err(StoreError::Conflicted {
            key: key.to_owned(),
            conflicts: marker.conflicts.clone(),
        }),
        None => Ok(()),
    }
}

/// Store `payload` at `key` as a local write. Returns the stored metadata.
pub fn put_local<S: Transactional>(
    store: &S,
    key: &str,
    payload: ExternalOf<S>,
    config: &ReplicationConfig,
) -> Result<Metadata, StoreError> {
    store.transaction(|txn| {
        let existing = txn.try_get_existing(key)?;
        refuse_conflicted(key, existing.as_ref())?;

        let version = txn.next_local_version()?;
        let metadata = history::stamp_local_write(
            existing.as_ref().map(|item| &item.metadata),
            txn.local_id(),
            version,
            config.max_history,
        );
        txn.add_without_conflict(key, existing.map(|item| item.etag), &metadata, payload)?;
        tracing::debug!(key, version, "local put");
        Ok(metadata)
    })
}

/// Delete `key` locally, leaving a tombstone.
///
/// Returns the tombstone's metadata, or `None` if the key does not exist.
/// Deleting an existing tombstone stamps a new version on it.
pub fn delete_local<S: Transactional>(
    store: &S,
    key: &str,
    config: &ReplicationConfig,
) -> Result<Option<Metadata>, StoreError> {
    store.transaction(|txn| {
        let Some(existing) = txn.try_get_existing(key)? else {
            return Ok(None);
        };
        refuse_conflicted(key, Some(&existing))?;

        let version = txn.next_local_version()?;
        let mut metadata = history::stamp_local_write(
            Some(&existing.metadata),
            txn.local_id(),
            version,
            config.max_history,
        );
        metadata.deleted = true;
        txn.delete_item(key, Some(existing.etag))?;
        txn.mark_as_deleted(key, &metadata)?;
        tracing::debug!(key, version, "local delete");
        Ok(Some(metadata))
    })
}

/// Resolve the conflict at `key` by writing `payload` over its marker.
///
/// `None` resolves the conflict as a deletion. The new write descends from
/// every side of the conflict, and the shadows are removed.
pub fn resolve_local<S: Transactional>(
    store: &S,
    key: &str,
    payload: Option<ExternalOf<S>>,
    config: &ReplicationConfig,
) -> Result<Metadata, StoreError> {
    store.transaction(|txn| {
        let conflicted = txn.try_get_existing(key)?.and_then(|item| {
            let marker = item.marker()?.clone();
            Some((item, marker))
        });
        let Some((existing, marker)) = conflicted else {
            return Err(StoreError::NotConflicted {
                key: key.to_owned(),
            });
        };

        // Side identities go last so bounding evicts older ancestry first.
        let mut lineage = History::new();
        let mut sides = Vec::with_capacity(marker.len());
        for shadow in &marker.conflicts {
            if let Some(side) = txn.try_get_existing(shadow)? {
                lineage = history::merge(&side.metadata.history, &lineage, usize::MAX);
                sides.extend(side.metadata.identity());
            }
        }
        let mut lineage = lineage.into_vec();
        lineage.retain(|entry| !sides.contains(entry));
        lineage.extend(sides);

        let version = txn.next_local_version()?;
        let mut metadata = Metadata::new(txn.local_id(), version).with_history(lineage);
        metadata.history.bound(config.max_history);
        metadata.collection.clone_from(&existing.metadata.collection);

        match payload {
            Some(payload) => {
                txn.add_without_conflict(key, Some(existing.etag), &metadata, payload)?;
            }
            None => {
                metadata.deleted = true;
                txn.delete_item(key, Some(existing.etag))?;
                txn.mark_as_deleted(key, &metadata)?;
            }
        }
        for shadow in &marker.conflicts {
            txn.delete_item(shadow, None)?;
        }
        tracing::debug!(key, version, sides = marker.len(), "resolved conflict locally");
        Ok(metadata)
    })
}
