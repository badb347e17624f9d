//! # replikit-store
//!
//! Storage backends for [`replikit`] replication.
//!
//! Each store holds one [`EntityKind`] and hands out transactions that
//! implement [`replikit::ReplicationStorage`]. Conflict notifications queued
//! by an intake run only after the transaction commits.
//!
//! | Backend | Feature | Use case |
//! |---------|---------|----------|
//! | [`MemoryStore`] | always | tests, rebuilt-on-start nodes |
//! | [`SqliteStore`] | `sqlite` (default) | durable nodes |
//!
//! ```
//! use replikit::{IntakeOutcome, ReplicationConfig, ReplicationIntake};
//! use replikit_store::{put_local, replicate, DocumentKind, MemoryStore};
//! use serde_json::json;
//!
//! let a = MemoryStore::<DocumentKind>::with_local_id("a");
//! let b = MemoryStore::<DocumentKind>::with_local_id("b");
//! let intake = ReplicationIntake::new();
//!
//! // A write on `a`, shipped to `b`.
//! let metadata = put_local(&a, "users/1", json!({"v": 1}), &ReplicationConfig::default()).unwrap();
//! let outcome = replicate(&b, &intake, "users/1", metadata, Some(json!({"v": 1}))).unwrap();
//! assert_eq!(outcome, IntakeOutcome::Created);
//! ```

#![warn(missing_docs)]

mod error;
pub mod kinds;
mod local;
mod memory;
mod record;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

pub use error::StoreError;
pub use kinds::{
    Counter, CounterKind, CounterMergeResolver, CounterUpdate, DocumentKind, EntityKind, FileBlob,
    FileKind,
};
pub use local::{delete_local, put_local, resolve_local};
pub use memory::{MemoryStore, MemoryTxn};
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, SqliteConfig, SqliteStore, SqliteTxn};
pub use traits::{ExternalOf, InternalOf, LocalVersions, Transactional};

use replikit::{IntakeOutcome, Metadata, ReplicationError, ReplicationIntake};

enum Failure {
    Intake(ReplicationError<StoreError>),
    Commit(StoreError),
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Self::Commit(e)
    }
}

/// Apply one incoming replicated write to `store` in its own transaction.
///
/// The intake's outcome is committed atomically; conflict notifications are
/// raised after the commit. A failed commit is reported as
/// [`ReplicationError::Storage`].
pub fn replicate<S: Transactional>(
    store: &S,
    intake: &ReplicationIntake<InternalOf<S>, ExternalOf<S>>,
    key: &str,
    metadata: Metadata,
    payload: Option<ExternalOf<S>>,
) -> Result<IntakeOutcome, ReplicationError<StoreError>> {
    store
        .transaction(|txn| {
            intake
                .replicate(txn, key, metadata, payload)
                .map_err(Failure::Intake)
        })
        .map_err(|failure| match failure {
            Failure::Intake(e) => e,
            Failure::Commit(source) => ReplicationError::Storage {
                key: key.to_owned(),
                source,
            },
        })
}
