use replikit::{ExistingItem, ReplicationStorage};

use crate::error::StoreError;
use crate::kinds::EntityKind;

/// Stored payload type of a store.
pub type InternalOf<S> = <<S as Transactional>::Kind as EntityKind>::Internal;

/// Incoming payload type of a store.
pub type ExternalOf<S> = <<S as Transactional>::Kind as EntityKind>::External;

/// Version allocation for writes originated on this node.
pub trait LocalVersions {
    /// Next version number for a local write. Strictly increasing per store.
    fn next_local_version(&mut self) -> Result<u64, StoreError>;
}

/// A store that runs closures inside atomic transactions.
///
/// The transaction handle implements [`ReplicationStorage`], so a
/// [`replikit::ReplicationIntake`] can run directly against it. If the
/// closure returns `Err`, every change is rolled back and queued post-commit
/// actions are dropped; otherwise they run once the commit is durable and
/// the store is unlocked.
pub trait Transactional {
    /// Entity kind held by the store.
    type Kind: EntityKind;

    /// Transaction handle.
    type Txn<'s>: ReplicationStorage<
            Internal = InternalOf<Self>,
            External = ExternalOf<Self>,
            Error = StoreError,
        > + LocalVersions
    where
        Self: 's;

    /// Stable identifier of this store, used as the local conflict discriminator.
    fn local_id(&self) -> &str;

    /// Run `f` atomically.
    fn transaction<'s, R, E>(
        &'s self,
        f: impl FnOnce(&mut Self::Txn<'s>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>;

    /// Read the record at `key`, including tombstones and conflict markers.
    fn get(&self, key: &str) -> Result<Option<ExistingItem<InternalOf<Self>>>, StoreError> {
        self.transaction(|txn| txn.try_get_existing(key))
    }
}
