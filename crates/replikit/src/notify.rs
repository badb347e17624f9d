//! Conflict notifications.
//!
//! Raised once per materialized conflict, after the transaction that created
//! it commits. Delivery is fire-and-forget: a failing observer is logged and
//! skipped, and never affects the intake that already committed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::BoxError;
use crate::metadata::Etag;
use crate::storage::ItemKind;

/// Replicated operation that produced a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum OperationKind {
    /// A replicated put.
    Put,
    /// A replicated delete.
    Delete,
}

/// A newly created or extended conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConflictNotification {
    /// Primary key now holding the conflict marker.
    pub id: String,
    /// Etag of the conflict marker.
    pub etag: Etag,
    /// Every shadow key in the conflict.
    pub conflicts: Vec<String>,
    /// Kind of the conflicted item.
    pub item_type: ItemKind,
    /// Operation that triggered the conflict.
    pub operation: OperationKind,
}

/// An observer of conflict notifications.
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification.
    fn raise(&self, notification: &ConflictNotification) -> Result<(), BoxError>;
}

impl<F> NotificationSink for F
where
    F: Fn(&ConflictNotification) -> Result<(), BoxError> + Send + Sync,
{
    fn raise(&self, notification: &ConflictNotification) -> Result<(), BoxError> {
        self(notification)
    }
}

/// Fans notifications out to registered sinks.
#[derive(Default)]
pub struct Notifier {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl Notifier {
    /// Notifier without sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. It receives every notification raised afterwards.
    pub fn register(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(sink);
    }

    /// Number of registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Deliver `notification` to every sink; returns how many accepted it.
    pub fn raise(&self, notification: &ConflictNotification) -> usize {
        let sinks = self.sinks.read().clone();
        let mut delivered = 0;
        for sink in sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.raise(notification))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(
                    id = %notification.id,
                    error = %e,
                    "conflict notification dropped by observer"
                ),
                Err(_) => tracing::warn!(
                    id = %notification.id,
                    "conflict observer panicked"
                ),
            }
        }
        tracing::debug!(
            id = %notification.id,
            conflicts = notification.conflicts.len(),
            delivered,
            "raised conflict notification"
        );
        delivered
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

/// Publishes notifications on a `tokio` broadcast channel.
///
/// Async observers call [`BroadcastSink::subscribe`]. Lagging receivers lose
/// the oldest notifications, as the channel does.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<ConflictNotification>,
}

impl BroadcastSink {
    /// Channel with room for `capacity` undelivered notifications.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// New receiver for notifications raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConflictNotification> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn raise(&self, notification: &ConflictNotification) -> Result<(), BoxError> {
        self.sender
            .send(notification.clone())
            .map(|_| ())
            .map_err(|_| "no active conflict subscribers".into())
    }
}
