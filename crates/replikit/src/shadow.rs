//! Conflict shadow naming.
//!
//! Each side of a conflict is stored under a shadow key derived from the
//! primary key and a discriminator: the origin of the incoming write, or the
//! local storage id for the side that was already stored. Redelivering the
//! same write therefore lands on the same shadow key.

use crate::metadata::Metadata;
use crate::storage::ReplicationStorage;

/// Path segment separating a primary key from its conflict discriminator.
pub const CONFLICTS_SEGMENT: &str = "/conflicts/";

/// `"<primary_key>/conflicts/<discriminator>"`.
pub fn conflict_shadow_key(primary_key: &str, discriminator: &str) -> String {
    let mut key =
        String::with_capacity(primary_key.len() + CONFLICTS_SEGMENT.len() + discriminator.len());
    key.push_str(primary_key);
    key.push_str(CONFLICTS_SEGMENT);
    key.push_str(discriminator);
    key
}

/// Discriminator for an incoming write: its replication source.
pub fn remote_discriminator(metadata: &Metadata) -> Option<&str> {
    metadata.source.as_deref()
}

/// Discriminator for the locally stored side: the storage's stable id.
pub fn local_discriminator<S: ReplicationStorage + ?Sized>(storage: &S) -> &str {
    storage.local_id()
}

/// Split a shadow key into `(primary_key, discriminator)`.
///
/// The last `/conflicts/` segment wins, so primary keys may themselves
/// contain the segment.
pub fn split_shadow_key(key: &str) -> Option<(&str, &str)> {
    let at = key.rfind(CONFLICTS_SEGMENT)?;
    let discriminator = &key[at + CONFLICTS_SEGMENT.len()..];
    if at == 0 || discriminator.is_empty() || discriminator.contains('/') {
        return None;
    }
    Some((&key[..at], discriminator))
}

/// Whether `key` names a conflict shadow.
pub fn is_shadow_key(key: &str) -> bool {
    split_shadow_key(key).is_some()
}
