//! Error types.
//!
//! A conflict is a successful intake outcome, never an error.

use crate::history::ReplicationEntry;

/// Boxed error returned by pluggable policies and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Both lineages record the other write as an ancestor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("incoming write {incoming} and stored write {existing} each list the other as an ancestor")]
pub struct CausalityViolation {
    /// Identity of the incoming write.
    pub incoming: ReplicationEntry,
    /// Identity of the stored write.
    pub existing: ReplicationEntry,
}

/// Failure of a replicated put or delete.
///
/// `E` is the storage error type; a rejected etag precondition surfaces as
/// [`ReplicationError::Storage`] wrapping the store's concurrency error.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError<E: std::error::Error + 'static> {
    /// Reading the current state failed. Retryable by the transport.
    #[error("replication read failed for key {key}")]
    Fetch {
        /// Key being replicated.
        key: String,
        /// Storage failure.
        #[source]
        source: E,
    },

    /// A storage write failed, including etag precondition failures.
    #[error("replication write failed for key {key}: {source}")]
    Storage {
        /// Key being replicated.
        key: String,
        /// Storage failure.
        #[source]
        source: E,
    },

    /// The resolution policy failed.
    #[error("conflict resolution failed for key {key}: {source}")]
    Resolver {
        /// Key being replicated.
        key: String,
        /// Policy failure.
        #[source]
        source: BoxError,
    },

    /// A resolution trigger rejected the resolved write.
    #[error("resolution trigger failed for key {key}: {source}")]
    Trigger {
        /// Key being replicated.
        key: String,
        /// Trigger failure.
        #[source]
        source: BoxError,
    },

    /// The incoming and stored lineages contradict each other.
    #[error("causality violation for key {key}: {violation}")]
    CausalityViolation {
        /// Key being replicated.
        key: String,
        /// The contradicting identities.
        violation: CausalityViolation,
    },

    /// The incoming write lacks a source or version where one is required.
    #[error("replicated write for key {key} has no replication source/version")]
    MissingIdentity {
        /// Key being replicated.
        key: String,
    },

    /// A put arrived without a payload.
    #[error("replicated put for key {key} has no payload")]
    MissingPayload {
        /// Key being replicated.
        key: String,
    },

    /// The incoming shadow would overwrite the local side of the conflict.
    #[error("conflict shadow {shadow} for key {key} is claimed by both the local and the remote side")]
    ShadowCollision {
        /// Key being replicated.
        key: String,
        /// The contested shadow key.
        shadow: String,
    },

    /// A tombstone was handed to the put path.
    #[error("replicated put for key {key} carries a delete marker")]
    DeleteMarkerOnPut {
        /// Key being replicated.
        key: String,
    },
}

impl<E: std::error::Error + 'static> ReplicationError<E> {
    /// Key the failed intake was for.
    pub fn key(&self) -> &str {
        match self {
            Self::Fetch { key, .. }
            | Self::Storage { key, .. }
            | Self::Resolver { key, .. }
            | Self::Trigger { key, .. }
            | Self::CausalityViolation { key, .. }
            | Self::MissingIdentity { key }
            | Self::MissingPayload { key }
            | Self::ShadowCollision { key, .. }
            | Self::DeleteMarkerOnPut { key } => key,
        }
    }

    /// The underlying storage error, if the failure came from storage.
    pub fn storage_error(&self) -> Option<&E> {
        match self {
            Self::Fetch { source, .. } | Self::Storage { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the transport should retry the write as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. })
    }
}

/// Invalid replication configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `max_history` must allow at least one entry.
    #[error("max_history must be at least 1")]
    ZeroHistory,

    /// The configuration text could not be parsed.
    #[cfg(feature = "serde")]
    #[error("invalid replication config: {0}")]
    Parse(#[from] toml::de::Error),
}
