//! Post-commit action list.
//!
//! Work that observers must only see once data is durable (conflict
//! notifications) is queued on the transaction and drained after commit.
//! A rollback discards the queue.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::storage::CommitAction;

/// Actions queued by one transaction.
#[derive(Default)]
pub struct PostCommit {
    actions: Vec<CommitAction>,
}

impl PostCommit {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action.
    pub fn push(&mut self, action: CommitAction) {
        self.actions.push(action);
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action in queue order. Call only after a successful commit.
    ///
    /// A panicking action is logged and does not stop the rest.
    pub fn run(self) {
        for action in self.actions {
            if catch_unwind(AssertUnwindSafe(action)).is_err() {
                tracing::warn!("post-commit action panicked");
            }
        }
    }

    /// Drop every action unrun, as on rollback.
    pub fn discard(self) {
        if !self.actions.is_empty() {
            tracing::debug!(
                discarded = self.actions.len(),
                "transaction rolled back, dropping post-commit actions"
            );
        }
    }
}

impl std::fmt::Debug for PostCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostCommit")
            .field("pending", &self.actions.len())
            .finish()
    }
}
