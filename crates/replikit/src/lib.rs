//! # replikit
//!
//! Conflict detection and resolution for multi-master replication.
//!
//! Every node accepts local writes and pushes them to its peers
//! asynchronously. A peer receiving a replicated put or delete has to merge
//! it against its own state without a coordinator. This crate implements
//! that merge, independently of the storage engine and of the entity kind:
//!
//! - [`history`]: bounded `(source, version)` lineages and the ancestry test
//! - [`shadow`]: deterministic naming of conflict shadows
//! - [`intake`]: the per-key decision procedure for incoming writes
//! - [`resolver`]: pluggable resolution policies and triggers
//! - [`notify`]: post-commit conflict notifications
//!
//! Storage is reached through the [`ReplicationStorage`] trait, bound to one
//! transaction of the caller's store. See `replikit-store` for in-memory and
//! SQLite implementations.
//!
//! ## Outcomes
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | key absent | stored as new (deletes are ignored) |
//! | same `(source, version)` already stored | replay, no-op |
//! | incoming descends from stored | overwrite, guarded by etag |
//! | delete meets tombstone | histories merged |
//! | policy resolves | resolved payload stored, or key removed |
//! | otherwise | conflict marker listing one shadow per side |
//!
//! A conflict is a normal outcome, never an error.

#![warn(missing_docs)]

pub mod commit;
mod config;
mod error;
pub mod history;
pub mod intake;
mod metadata;
pub mod notify;
pub mod resolver;
pub mod shadow;
mod storage;

pub use commit::PostCommit;
pub use config::{ReplicationConfig, ReplicationConfigBuilder};
pub use error::{BoxError, CausalityViolation, ConfigError, ReplicationError};
pub use history::{Ancestry, History, ReplicationEntry};
pub use intake::{IntakeOutcome, ReplicationIntake, ReplicationIntakeBuilder};
pub use metadata::{Etag, Metadata};
pub use notify::{BroadcastSink, ConflictNotification, NotificationSink, Notifier, OperationKind};
pub use resolver::{
    ConflictResolver, PreferLocal, PreferNewest, PreferRemote, Resolution, ResolutionTrigger,
    ResolverChain,
};
pub use storage::{
    CommitAction, ConflictMarker, ConflictRecord, ExistingItem, ItemKind, ReplicationStorage,
    StoredPayload,
};
