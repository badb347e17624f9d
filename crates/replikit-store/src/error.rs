use replikit::Etag;

/// Error type shared by the storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An etag precondition did not hold: another writer got there first.
    #[error("concurrency conflict on {key}: expected etag {expected}, found {actual:?}")]
    ConcurrencyConflict {
        /// Key written.
        key: String,
        /// Etag the writer expected.
        expected: Etag,
        /// Etag actually stored (`None` if the key is absent).
        actual: Option<Etag>,
    },

    /// A conflict operation targeted a key that holds no conflict marker.
    #[error("{key} is not in conflict")]
    NotConflicted {
        /// Key addressed.
        key: String,
    },

    /// A local write targeted a conflicted key.
    #[error("{key} is in conflict between {} sides and must be resolved first", conflicts.len())]
    Conflicted {
        /// Key addressed.
        key: String,
        /// Shadow keys of the conflict.
        conflicts: Vec<String>,
    },

    /// A value could not be serialized.
    #[error("failed to encode {what}: {message}")]
    Encode {
        /// What was being encoded.
        what: &'static str,
        /// Encoder message.
        message: String,
    },

    /// A stored value could not be deserialized.
    #[error("failed to decode {what}: {message}")]
    Decode {
        /// What was being decoded.
        what: &'static str,
        /// Decoder message.
        message: String,
    },

    /// An error from rusqlite.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether this is an optimistic-concurrency failure.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub(crate) fn encode(what: &'static str, e: impl std::fmt::Display) -> Self {
        Self::Encode {
            what,
            message: e.to_string(),
        }
    }

    pub(crate) fn decode(what: &'static str, e: impl std::fmt::Display) -> Self {
        Self::Decode {
            what,
            message: e.to_string(),
        }
    }
}
