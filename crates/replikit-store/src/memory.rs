//! In-memory replication store.
//!
//! Records live in a `BTreeMap` behind a mutex; nothing touches disk.
//! Useful for tests and for nodes whose state is rebuilt on start.
//!
//! # Example
//!
//! ```
//! use replikit::Metadata;
//! use replikit_store::{DocumentKind, MemoryStore, Transactional};
//!
//! let store = MemoryStore::<DocumentKind>::with_local_id("node-a");
//! let intake = replikit::ReplicationIntake::new();
//!
//! let outcome = replikit_store::replicate(
//!     &store,
//!     &intake,
//!     "users/1",
//!     Metadata::new("node-b", 1),
//!     Some(serde_json::json!({ "name": "ada" })),
//! )
//! .unwrap();
//! assert_eq!(outcome, replikit::IntakeOutcome::Created);
//! assert!(store.get("users/1").unwrap().is_some());
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;

use parking_lot::{Mutex, MutexGuard};
use replikit::{
    CommitAction, ConflictRecord, Etag, ExistingItem, ItemKind, Metadata, PostCommit,
    ReplicationStorage, StoredPayload,
};

use crate::error::StoreError;
use crate::kinds::EntityKind;
use crate::record::{self, RecordBackend};
use crate::traits::{LocalVersions, Transactional};

struct State<I> {
    records: BTreeMap<String, ExistingItem<I>>,
    last_etag: u64,
    last_version: u64,
}

/// In-memory store for one entity kind.
///
/// Transactions are serialized by a single lock. Writes are staged in an
/// overlay and only applied when the closure succeeds.
pub struct MemoryStore<K: EntityKind> {
    local_id: String,
    state: Mutex<State<K::Internal>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: EntityKind> MemoryStore<K> {
    /// Empty store with a freshly generated local id.
    pub fn new() -> Self {
        Self::with_local_id(uuid::Uuid::new_v4().to_string())
    }

    /// Empty store with the given local id.
    pub fn with_local_id(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            state: Mutex::new(State {
                records: BTreeMap::new(),
                last_etag: 0,
                last_version: 0,
            }),
            _kind: PhantomData,
        }
    }

    /// All stored keys in order, shadows and tombstones included.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().records.keys().cloned().collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether the store holds no record.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }
}

impl<K: EntityKind> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityKind> std::fmt::Debug for MemoryStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("local_id", &self.local_id)
            .field("kind", &K::KIND)
            .field("records", &self.state.try_lock().map(|state| state.records.len()))
            .finish()
    }
}

impl<K: EntityKind> Transactional for MemoryStore<K> {
    type Kind = K;
    type Txn<'s> = MemoryTxn<'s, K>;

    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn transaction<'s, R, E>(
        &'s self,
        f: impl FnOnce(&mut MemoryTxn<'s, K>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let state = self.state.lock();
        let mut txn = MemoryTxn {
            local_id: &self.local_id,
            next_etag: state.last_etag,
            next_version: state.last_version,
            state,
            overlay: BTreeMap::new(),
            post_commit: PostCommit::new(),
        };
        match f(&mut txn) {
            Ok(result) => {
                txn.commit().run();
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(staged = txn.overlay.len(), "memory transaction rolled back");
                txn.post_commit.discard();
                Err(e)
            }
        }
    }
}

/// An open [`MemoryStore`] transaction.
pub struct MemoryTxn<'s, K: EntityKind> {
    local_id: &'s str,
    state: MutexGuard<'s, State<K::Internal>>,
    /// Staged writes; `None` is a removal.
    overlay: BTreeMap<String, Option<ExistingItem<K::Internal>>>,
    next_etag: u64,
    next_version: u64,
    post_commit: PostCommit,
}

impl<'s, K: EntityKind> MemoryTxn<'s, K> {
    /// Apply staged writes and release the lock.
    fn commit(self) -> PostCommit {
        let MemoryTxn {
            mut state,
            overlay,
            next_etag,
            next_version,
            post_commit,
            ..
        } = self;
        let writes = overlay.len();
        for (key, record) in overlay {
            match record {
                Some(record) => {
                    state.records.insert(key, record);
                }
                None => {
                    state.records.remove(&key);
                }
            }
        }
        state.last_etag = next_etag;
        state.last_version = next_version;
        drop(state);
        tracing::trace!(writes, "memory transaction committed");
        post_commit
    }
}

impl<K: EntityKind> RecordBackend for MemoryTxn<'_, K> {
    type Internal = K::Internal;

    fn read(&mut self, key: &str) -> Result<Option<ExistingItem<K::Internal>>, StoreError> {
        Ok(match self.overlay.get(key) {
            Some(staged) => staged.clone(),
            None => self.state.records.get(key).cloned(),
        })
    }

    fn write(
        &mut self,
        key: &str,
        payload: StoredPayload<K::Internal>,
        metadata: Metadata,
    ) -> Result<Etag, StoreError> {
        self.next_etag += 1;
        let etag = Etag(self.next_etag);
        self.overlay.insert(
            key.to_owned(),
            Some(ExistingItem {
                payload,
                etag,
                metadata,
            }),
        );
        Ok(etag)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.overlay.insert(key.to_owned(), None);
        Ok(())
    }
}

impl<K: EntityKind> LocalVersions for MemoryTxn<'_, K> {
    fn next_local_version(&mut self) -> Result<u64, StoreError> {
        self.next_version += 1;
        Ok(self.next_version)
    }
}

impl<K: EntityKind> ReplicationStorage for MemoryTxn<'_, K> {
    type Internal = K::Internal;
    type External = K::External;
    type Error = StoreError;

    fn item_kind(&self) -> ItemKind {
        K::KIND
    }

    fn local_id(&self) -> &str {
        self.local_id
    }

    fn try_get_existing(
        &mut self,
        key: &str,
    ) -> Result<Option<ExistingItem<K::Internal>>, StoreError> {
        self.read(key)
    }

    fn add_without_conflict(
        &mut self,
        key: &str,
        expected_etag: Option<Etag>,
        metadata: &Metadata,
        payload: K::External,
    ) -> Result<Etag, StoreError> {
        record::add_without_conflict(self, key, expected_etag, metadata, K::internalize(payload))
    }

    fn delete_item(&mut self, key: &str, expected_etag: Option<Etag>) -> Result<(), StoreError> {
        record::delete_item(self, key, expected_etag)
    }

    fn mark_as_deleted(&mut self, key: &str, metadata: &Metadata) -> Result<Etag, StoreError> {
        record::mark_as_deleted(self, key, metadata)
    }

    fn create_conflict(
        &mut self,
        key: &str,
        new_shadow_key: &str,
        existing_shadow_key: &str,
        existing: &ExistingItem<K::Internal>,
    ) -> Result<ConflictRecord, StoreError> {
        record::create_conflict(self, key, new_shadow_key, existing_shadow_key, existing)
    }

    fn append_to_conflict(
        &mut self,
        key: &str,
        new_shadow_key: &str,
        existing: &ExistingItem<K::Internal>,
    ) -> Result<ConflictRecord, StoreError> {
        record::append_to_conflict(self, key, new_shadow_key, existing)
    }

    fn on_commit(&mut self, action: CommitAction) {
        self.post_commit.push(action);
    }
}
