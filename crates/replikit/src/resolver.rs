//! Resolution policies and post-resolution triggers.
//!
//! When an incoming write neither descends from the stored one nor replays
//! it, the intake asks a [`ConflictResolver`] before materializing a
//! conflict. Resolvers are pluggable per entity kind; a [`ResolverChain`]
//! tries several in registration order.
//!
//! Resolved metadata should descend from both sides so that peers receiving
//! the resolution accept it without conflicting again. The built-in
//! resolvers fold the losing lineage into the winner's; the intake bounds
//! the result to the configured history length.

use crate::error::BoxError;
use crate::history::{self, History};
use crate::metadata::Metadata;
use crate::storage::{ExistingItem, StoredPayload};

/// Outcome of a successful policy resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<E> {
    /// Overwrite the key with this payload.
    Keep {
        /// Metadata stored with the resolved payload.
        metadata: Metadata,
        /// The resolved payload.
        payload: E,
    },
    /// Remove the key, leaving a tombstone with this metadata.
    Remove {
        /// Metadata stored on the tombstone.
        metadata: Metadata,
    },
}

impl<E> Resolution<E> {
    /// Metadata carried by the resolution.
    pub fn metadata(&self) -> &Metadata {
        match self {
            Self::Keep { metadata, .. } | Self::Remove { metadata } => metadata,
        }
    }
}

/// Policy deciding concurrent writes without creating a conflict.
///
/// `incoming_payload` is `None` for replicated deletes. Returning `Ok(None)`
/// declines; the intake then materializes a conflict.
pub trait ConflictResolver<I, E>: Send + Sync {
    /// Try to resolve `incoming` against the stored `existing` record.
    fn try_resolve(
        &self,
        key: &str,
        incoming: &Metadata,
        incoming_payload: Option<&E>,
        existing: &ExistingItem<I>,
    ) -> Result<Option<Resolution<E>>, BoxError>;
}

/// Hook run when a policy resolution overwrites data.
///
/// Replication bypasses the ordinary write pipeline, so logic that normally
/// runs on direct writes gets a chance to run here. An error aborts the
/// intake for the key.
pub trait ResolutionTrigger<E>: Send + Sync {
    /// Called with the resolved payload and the incoming write's metadata,
    /// before the overwrite.
    fn on_resolved(&self, key: &str, payload: &E, original: &Metadata) -> Result<(), BoxError>;
}

/// Resolvers tried in order; the first resolution wins.
///
/// An empty chain declines every conflict.
pub struct ResolverChain<I, E> {
    resolvers: Vec<Box<dyn ConflictResolver<I, E>>>,
}

impl<I, E> ResolverChain<I, E> {
    /// Empty chain.
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
        }
    }

    /// Append a resolver.
    #[must_use]
    pub fn with(mut self, resolver: impl ConflictResolver<I, E> + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    /// Number of registered resolvers.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// Whether no resolver is registered.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl<I, E> Default for ResolverChain<I, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, E> ConflictResolver<I, E> for ResolverChain<I, E> {
    fn try_resolve(
        &self,
        key: &str,
        incoming: &Metadata,
        incoming_payload: Option<&E>,
        existing: &ExistingItem<I>,
    ) -> Result<Option<Resolution<E>>, BoxError> {
        for resolver in &self.resolvers {
            if let Some(resolution) = resolver.try_resolve(key, incoming, incoming_payload, existing)? {
                return Ok(Some(resolution));
            }
        }
        Ok(None)
    }
}

/// `winner` metadata whose lineage also covers `loser`.
///
/// The loser's identity is placed last, so it survives any later bounding
/// of the lineage.
pub fn descend_from_both(winner: &Metadata, loser: &Metadata) -> Metadata {
    let mut lineage = history::merge(&winner.history, &loser.history, usize::MAX).into_vec();
    if let Some(id) = loser.identity() {
        lineage.retain(|entry| *entry != id);
        lineage.push(id);
    }

    let mut resolved = winner.clone();
    resolved.history = History::from(lineage);
    resolved.conflict = false;
    resolved.conflict_document = false;
    resolved
}

/// The incoming write always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferRemote;

impl<I, E: Clone> ConflictResolver<I, E> for PreferRemote {
    fn try_resolve(
        &self,
        _key: &str,
        incoming: &Metadata,
        incoming_payload: Option<&E>,
        existing: &ExistingItem<I>,
    ) -> Result<Option<Resolution<E>>, BoxError> {
        let metadata = descend_from_both(incoming, &existing.metadata);
        Ok(Some(match incoming_payload {
            Some(payload) => Resolution::Keep {
                metadata,
                payload: payload.clone(),
            },
            None => Resolution::Remove { metadata },
        }))
    }
}

/// The stored write always wins. Declines against conflict markers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocal;

impl<I: Clone, E: From<I>> ConflictResolver<I, E> for PreferLocal {
    fn try_resolve(
        &self,
        _key: &str,
        incoming: &Metadata,
        _incoming_payload: Option<&E>,
        existing: &ExistingItem<I>,
    ) -> Result<Option<Resolution<E>>, BoxError> {
        let metadata = descend_from_both(&existing.metadata, incoming);
        Ok(match &existing.payload {
            StoredPayload::Data(data) => Some(Resolution::Keep {
                metadata,
                payload: E::from(data.clone()),
            }),
            StoredPayload::Tombstone => Some(Resolution::Remove { metadata }),
            StoredPayload::ConflictMarker(_) => None,
        })
    }
}

/// The write with the larger application timestamp wins.
///
/// The timestamp is read from `Metadata::extra[field]` as an integer.
/// Missing or unparsable timestamps, and ties, decline.
#[derive(Debug, Clone)]
pub struct PreferNewest {
    field: String,
}

impl PreferNewest {
    /// Compare the integer stored under `field`.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    fn timestamp(&self, metadata: &Metadata) -> Option<i64> {
        metadata.extra.get(&self.field)?.parse().ok()
    }
}

impl<I: Clone, E: Clone + From<I>> ConflictResolver<I, E> for PreferNewest {
    fn try_resolve(
        &self,
        key: &str,
        incoming: &Metadata,
        incoming_payload: Option<&E>,
        existing: &ExistingItem<I>,
    ) -> Result<Option<Resolution<E>>, BoxError> {
        let (Some(remote), Some(local)) = (self.timestamp(incoming), self.timestamp(&existing.metadata))
        else {
            return Ok(None);
        };
        match remote.cmp(&local) {
            std::cmp::Ordering::Greater => {
                PreferRemote.try_resolve(key, incoming, incoming_payload, existing)
            }
            std::cmp::Ordering::Less => {
                PreferLocal.try_resolve(key, incoming, incoming_payload, existing)
            }
            std::cmp::Ordering::Equal => Ok(None),
        }
    }
}
