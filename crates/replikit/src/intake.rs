//! Replication intake: the per-key decision procedure for incoming writes.
//!
//! Each call runs inside a storage transaction owned by the caller and
//! reaches one of these outcomes:
//!
//! ```text
//!                 ┌──────────── absent ───────────► Created / Ignored (delete)
//!                 │
//! incoming ──► fetch ── same (source, version) ──► Replayed
//!                 │
//!                 ├── tombstone + delete ─────────► HistoriesMerged
//!                 │
//!                 ├── descendant (not a marker) ──► Overwritten / Deleted
//!                 │
//!                 ├── policy resolves ────────────► Resolved / ResolvedAsRemoved
//!                 │
//!                 └── otherwise ──────────────────► Conflict (created or appended)
//! ```
//!
//! No state lives in [`ReplicationIntake`] besides configuration and
//! policies; one intake can serve many worker threads. The protocol reads
//! then writes without locking, so the caller must not run two intakes for
//! the same key concurrently.

use std::sync::Arc;

use crate::config::ReplicationConfig;
use crate::error::{ConfigError, ReplicationError};
use crate::history::{self, Ancestry, History};
use crate::metadata::Metadata;
use crate::notify::{ConflictNotification, Notifier, OperationKind};
use crate::resolver::{ConflictResolver, Resolution, ResolutionTrigger, ResolverChain};
use crate::shadow::{conflict_shadow_key, local_discriminator, remote_discriminator};
use crate::storage::{ConflictRecord, ExistingItem, ReplicationStorage};

/// What an intake did with an incoming write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// The key did not exist; the write was stored as-is.
    Created,
    /// The write descended from the stored one and replaced it.
    Overwritten,
    /// The same write was already applied.
    Replayed,
    /// The stored write already descends from the incoming one.
    Stale,
    /// A delete arrived for a key that does not exist.
    Ignored,
    /// A delete met a local tombstone; their histories were merged.
    HistoriesMerged,
    /// The delete descended from the stored item and removed it.
    Deleted,
    /// The resolution policy produced a payload that replaced the key.
    Resolved,
    /// The resolution policy removed the key.
    ResolvedAsRemoved,
    /// The write was stored as a conflict shadow.
    Conflict {
        /// The conflict as it stands now.
        record: ConflictRecord,
        /// Whether this write turned the key into a conflict marker.
        created: bool,
    },
}

impl IntakeOutcome {
    /// Whether the write ended up in a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the write changed nothing.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Replayed | Self::Stale | Self::Ignored)
    }
}

type IntakeResult<E> = Result<IntakeOutcome, ReplicationError<E>>;

/// Applies incoming replicated writes for one payload representation.
///
/// `I` is the stored payload type and `E` the incoming (wire) type of the
/// storages this intake runs against.
pub struct ReplicationIntake<I, E> {
    config: ReplicationConfig,
    resolver: Box<dyn ConflictResolver<I, E>>,
    triggers: Vec<Arc<dyn ResolutionTrigger<E>>>,
    notifier: Arc<Notifier>,
}

impl<I: 'static, E: 'static> ReplicationIntake<I, E> {
    /// Intake with default config, no resolver, no triggers and a fresh notifier.
    pub fn new() -> Self {
        Self {
            config: ReplicationConfig::default(),
            resolver: Box::new(ResolverChain::new()),
            triggers: Vec::new(),
            notifier: Arc::new(Notifier::new()),
        }
    }

    /// Start building an intake.
    pub fn builder() -> ReplicationIntakeBuilder<I, E> {
        ReplicationIntakeBuilder {
            intake: Self::new(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Notifier conflict notifications are raised on.
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Apply an incoming write, routing tombstones to the delete path.
    pub fn replicate<S>(
        &self,
        storage: &mut S,
        key: &str,
        metadata: Metadata,
        payload: Option<E>,
    ) -> IntakeResult<S::Error>
    where
        S: ReplicationStorage<Internal = I, External = E>,
    {
        if metadata.deleted {
            return self.replicate_delete(storage, key, metadata);
        }
        match payload {
            Some(payload) => self.replicate_put(storage, key, metadata, payload),
            None => Err(ReplicationError::MissingPayload { key: key.to_owned() }),
        }
    }

    /// Apply an incoming put.
    pub fn replicate_put<S>(
        &self,
        storage: &mut S,
        key: &str,
        mut metadata: Metadata,
        payload: E,
    ) -> IntakeResult<S::Error>
    where
        S: ReplicationStorage<Internal = I, External = E>,
    {
        if metadata.deleted {
            return Err(ReplicationError::DeleteMarkerOnPut { key: key.to_owned() });
        }
        let Some(incoming) = metadata.identity() else {
            return Err(ReplicationError::MissingIdentity { key: key.to_owned() });
        };
        metadata.history.bound(self.config.max_history);

        let span = tracing::debug_span!(
            "replicate_put",
            key,
            source = %incoming.source,
            version = incoming.version
        );
        let _guard = span.enter();

        let Some(existing) = fetch(storage, key)? else {
            storage
                .add_without_conflict(key, None, &metadata, payload)
                .map_err(|source| write_failed(key, source))?;
            tracing::debug!("accepted new item");
            return Ok(IntakeOutcome::Created);
        };

        if existing.metadata.same_identity(&metadata)
            || holds_side(storage, key, &existing, &metadata)?
        {
            tracing::debug!("replayed put ignored");
            return Ok(IntakeOutcome::Replayed);
        }

        if !existing.is_conflict_marker() {
            match ancestry::<S::Error>(key, &metadata, &existing.metadata)? {
                Ancestry::Descendant => {
                    storage
                        .add_without_conflict(key, Some(existing.etag), &metadata, payload)
                        .map_err(|source| write_failed(key, source))?;
                    tracing::debug!(etag = %existing.etag, "accepted descendant put");
                    return Ok(IntakeOutcome::Overwritten);
                }
                Ancestry::Ancestor => {
                    tracing::debug!("stale put ignored");
                    return Ok(IntakeOutcome::Stale);
                }
                Ancestry::Same | Ancestry::Concurrent => {}
            }
        }

        let resolution =
            self.try_resolve::<S::Error>(key, &metadata, Some(&payload), &existing)?;
        if let Some(resolution) = resolution {
            return self.apply_resolution(storage, key, &metadata, &existing, resolution);
        }

        self.materialize(storage, key, metadata, Some(payload), &existing, OperationKind::Put)
    }

    /// Apply an incoming delete.
    pub fn replicate_delete<S>(
        &self,
        storage: &mut S,
        key: &str,
        mut metadata: Metadata,
    ) -> IntakeResult<S::Error>
    where
        S: ReplicationStorage<Internal = I, External = E>,
    {
        metadata.deleted = true;
        metadata.history.bound(self.config.max_history);
        let entry = metadata.identity();

        let span = tracing::debug_span!(
            "replicate_delete",
            key,
            source = metadata.source.as_deref().unwrap_or("-"),
            version = metadata.version
        );
        let _guard = span.enter();

        let Some(existing) = fetch(storage, key)? else {
            tracing::debug!("delete for missing item ignored");
            return Ok(IntakeOutcome::Ignored);
        };

        if existing.metadata.collection.is_some() {
            metadata.collection.clone_from(&existing.metadata.collection);
        }

        if let Some(entry) = &entry {
            let seen = existing.metadata.history.covers(entry)
                || existing.metadata.identity().as_ref() == Some(entry)
                || holds_side(storage, key, &existing, &metadata)?;
            if seen {
                tracing::debug!("replayed delete ignored");
                return Ok(IntakeOutcome::Replayed);
            }
        }

        if existing.is_tombstone() && !existing.is_conflict_marker() {
            let mut incoming_lineage = metadata.history.clone().into_vec();
            incoming_lineage.extend(entry);
            let mut existing_lineage = existing.metadata.history.clone().into_vec();
            existing_lineage.extend(existing.metadata.identity());

            metadata.history = history::merge(
                &History::from(incoming_lineage),
                &History::from(existing_lineage),
                self.config.max_history,
            );
            metadata.merged_history = true;
            storage
                .mark_as_deleted(key, &metadata)
                .map_err(|source| write_failed(key, source))?;
            tracing::debug!(history = metadata.history.len(), "merged tombstone histories");
            return Ok(IntakeOutcome::HistoriesMerged);
        }

        if existing.is_conflict_marker() {
            return self.materialize(storage, key, metadata, None, &existing, OperationKind::Delete);
        }

        match ancestry::<S::Error>(key, &metadata, &existing.metadata)? {
            Ancestry::Descendant => {
                storage
                    .delete_item(key, Some(existing.etag))
                    .map_err(|source| write_failed(key, source))?;
                storage
                    .mark_as_deleted(key, &metadata)
                    .map_err(|source| write_failed(key, source))?;
                tracing::debug!("accepted descendant delete");
                return Ok(IntakeOutcome::Deleted);
            }
            Ancestry::Ancestor => {
                tracing::debug!("stale delete ignored");
                return Ok(IntakeOutcome::Stale);
            }
            Ancestry::Same | Ancestry::Concurrent => {}
        }

        let resolution = self.try_resolve::<S::Error>(key, &metadata, None, &existing)?;
        if let Some(resolution) = resolution {
            return self.apply_resolution(storage, key, &metadata, &existing, resolution);
        }

        self.materialize(storage, key, metadata, None, &existing, OperationKind::Delete)
    }

    fn try_resolve<X: std::error::Error + 'static>(
        &self,
        key: &str,
        metadata: &Metadata,
        payload: Option<&E>,
        existing: &ExistingItem<I>,
    ) -> Result<Option<Resolution<E>>, ReplicationError<X>> {
        self.resolver
            .try_resolve(key, metadata, payload, existing)
            .map_err(|source| ReplicationError::Resolver {
                key: key.to_owned(),
                source,
            })
    }

    fn apply_resolution<S>(
        &self,
        storage: &mut S,
        key: &str,
        original: &Metadata,
        existing: &ExistingItem<I>,
        resolution: Resolution<E>,
    ) -> IntakeResult<S::Error>
    where
        S: ReplicationStorage<Internal = I, External = E>,
    {
        let outcome = match resolution {
            Resolution::Remove { mut metadata } => {
                self.settle(&mut metadata);
                metadata.deleted = true;
                storage
                    .delete_item(key, None)
                    .map_err(|source| write_failed(key, source))?;
                storage
                    .mark_as_deleted(key, &metadata)
                    .map_err(|source| write_failed(key, source))?;
                tracing::debug!("policy resolved conflict by removal");
                IntakeOutcome::ResolvedAsRemoved
            }
            Resolution::Keep {
                mut metadata,
                payload,
            } => {
                self.settle(&mut metadata);
                metadata.deleted = false;
                if storage.item_kind().fires_triggers() {
                    for trigger in &self.triggers {
                        trigger.on_resolved(key, &payload, original).map_err(|source| {
                            ReplicationError::Trigger {
                                key: key.to_owned(),
                                source,
                            }
                        })?;
                    }
                }
                let expected = (!existing.is_tombstone()).then_some(existing.etag);
                storage
                    .add_without_conflict(key, expected, &metadata, payload)
                    .map_err(|source| write_failed(key, source))?;
                tracing::debug!("policy resolved conflict");
                IntakeOutcome::Resolved
            }
        };

        if let Some(marker) = existing.marker() {
            for shadow in &marker.conflicts {
                storage
                    .delete_item(shadow, None)
                    .map_err(|source| write_failed(key, source))?;
            }
            tracing::debug!(shadows = marker.len(), "removed resolved conflict shadows");
        }

        Ok(outcome)
    }

    fn settle(&self, metadata: &mut Metadata) {
        metadata.conflict = false;
        metadata.conflict_document = false;
        metadata.history.bound(self.config.max_history);
    }

    fn materialize<S>(
        &self,
        storage: &mut S,
        key: &str,
        metadata: Metadata,
        payload: Option<E>,
        existing: &ExistingItem<I>,
        operation: OperationKind,
    ) -> IntakeResult<S::Error>
    where
        S: ReplicationStorage<Internal = I, External = E>,
    {
        let Some(remote) = remote_discriminator(&metadata) else {
            return Err(ReplicationError::MissingIdentity { key: key.to_owned() });
        };
        let new_shadow = conflict_shadow_key(key, remote);
        let local_shadow = conflict_shadow_key(key, local_discriminator(&*storage));
        if local_shadow == new_shadow {
            return Err(ReplicationError::ShadowCollision {
                key: key.to_owned(),
                shadow: new_shadow,
            });
        }
        let created = !existing.is_conflict_marker();
        let joined = created
            || !existing
                .marker()
                .is_some_and(|marker| marker.conflicts.contains(&new_shadow));

        let side = metadata.as_conflict_side();
        let saved = match payload {
            Some(payload) => storage.add_without_conflict(&new_shadow, None, &side, payload),
            None => storage.mark_as_deleted(&new_shadow, &side),
        };
        saved.map_err(|source| write_failed(key, source))?;

        let record = if created {
            storage.create_conflict(key, &new_shadow, &local_shadow, existing)
        } else {
            storage.append_to_conflict(key, &new_shadow, existing)
        }
        .map_err(|source| write_failed(key, source))?;

        if !joined {
            tracing::debug!(shadow = %new_shadow, "conflict side rewritten in place");
            return Ok(IntakeOutcome::Conflict { record, created });
        }

        tracing::info!(
            key,
            shadow = %new_shadow,
            conflicts = record.conflicted_ids.len(),
            created,
            "replication conflict"
        );

        let notification = ConflictNotification {
            id: key.to_owned(),
            etag: record.etag,
            conflicts: record.conflicted_ids.clone(),
            item_type: storage.item_kind(),
            operation,
        };
        let notifier = Arc::clone(&self.notifier);
        storage.on_commit(Box::new(move || {
            notifier.raise(&notification);
        }));

        Ok(IntakeOutcome::Conflict { record, created })
    }
}

impl<I: 'static, E: 'static> Default for ReplicationIntake<I, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, E> std::fmt::Debug for ReplicationIntake<I, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationIntake")
            .field("config", &self.config)
            .field("triggers", &self.triggers.len())
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ReplicationIntake`].
pub struct ReplicationIntakeBuilder<I, E> {
    intake: ReplicationIntake<I, E>,
}

impl<I: 'static, E: 'static> ReplicationIntakeBuilder<I, E> {
    /// Use `config`.
    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.intake.config = config;
        self
    }

    /// Use `resolver` as the resolution policy.
    pub fn resolver(mut self, resolver: impl ConflictResolver<I, E> + 'static) -> Self {
        self.intake.resolver = Box::new(resolver);
        self
    }

    /// Run `trigger` on policy resolutions of trigger-capable kinds.
    pub fn trigger(mut self, trigger: Arc<dyn ResolutionTrigger<E>>) -> Self {
        self.intake.triggers.push(trigger);
        self
    }

    /// Raise conflict notifications on `notifier`.
    pub fn notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.intake.notifier = notifier;
        self
    }

    /// Validate the configuration and build.
    pub fn build(self) -> Result<ReplicationIntake<I, E>, ConfigError> {
        self.intake.config.validate()?;
        Ok(self.intake)
    }
}

fn fetch<S: ReplicationStorage>(
    storage: &mut S,
    key: &str,
) -> Result<Option<ExistingItem<S::Internal>>, ReplicationError<S::Error>> {
    storage.try_get_existing(key).map_err(|source| {
        tracing::error!(key, error = %source, "failed to read existing item");
        ReplicationError::Fetch {
            key: key.to_owned(),
            source,
        }
    })
}

/// Whether a side of the conflict stored at `key` already carries the
/// identity of `incoming`.
fn holds_side<S: ReplicationStorage>(
    storage: &mut S,
    key: &str,
    existing: &ExistingItem<S::Internal>,
    incoming: &Metadata,
) -> Result<bool, ReplicationError<S::Error>> {
    let Some(marker) = existing.marker() else {
        return Ok(false);
    };
    for shadow in &marker.conflicts {
        let side = storage.try_get_existing(shadow).map_err(|source| {
            tracing::error!(key, shadow = %shadow, error = %source, "failed to read conflict side");
            ReplicationError::Fetch {
                key: key.to_owned(),
                source,
            }
        })?;
        if side.is_some_and(|side| side.metadata.same_identity(incoming)) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn ancestry<X: std::error::Error + 'static>(
    key: &str,
    incoming: &Metadata,
    existing: &Metadata,
) -> Result<Ancestry, ReplicationError<X>> {
    history::check_ancestry(incoming, existing).map_err(|violation| {
        tracing::error!(key, %violation, "mutual ancestry between replicated writes");
        ReplicationError::CausalityViolation {
            key: key.to_owned(),
            violation,
        }
    })
}

fn write_failed<X: std::error::Error + 'static>(key: &str, source: X) -> ReplicationError<X> {
    ReplicationError::Storage {
        key: key.to_owned(),
        source,
    }
}
