//! SQLite replication store using rusqlite.
//!
//! Primary backend for nodes that must survive restarts. Uses WAL mode by
//! default. The local id and the etag/version counters live in the
//! `replikit_meta` table, so a reopened database keeps its identity and
//! never reissues an etag.
//!
//! # Example
//!
//! ```no_run
//! use replikit_store::{DocumentKind, SqliteStore, Transactional};
//!
//! let store = SqliteStore::<DocumentKind>::open("node.db").unwrap();
//! println!("local id: {}", store.local_id());
//! ```

use std::marker::PhantomData;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use replikit::{
    CommitAction, ConflictMarker, ConflictRecord, Etag, ExistingItem, ItemKind, Metadata,
    PostCommit, ReplicationStorage, StoredPayload,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::kinds::EntityKind;
use crate::record::{self, RecordBackend};
use crate::traits::{LocalVersions, Transactional};

const LOCAL_ID: &str = "local_id";
const LAST_ETAG: &str = "last_etag";
const LAST_VERSION: &str = "last_version";

const STATE_DATA: i64 = 0;
const STATE_MARKER: i64 = 1;
const STATE_TOMBSTONE: i64 = 2;

/// SQLite configuration options.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
    /// SQLite page size. Defaults to 4096.
    pub page_size: u32,
    /// Local id to record when the database is created.
    ///
    /// Ignored for databases that already have one. A random UUID is used
    /// when unset.
    pub local_id: Option<String>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
            page_size: 4096,
            local_id: None,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Write-ahead logging; readers proceed during writes.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal, no crash recovery.
    Memory,
}

impl JournalMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// SQLite store for one entity kind.
///
/// Several kinds may share one database file; their records are kept apart
/// by a `kind` column. Transactions run as `BEGIN IMMEDIATE` on a single
/// connection behind a mutex.
pub struct SqliteStore<K: EntityKind> {
    conn: Mutex<Connection>,
    local_id: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K: EntityKind> SqliteStore<K> {
    /// Open (or create) a database at `path` with default config.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with_config(path, SqliteConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, config)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, SqliteConfig::default())
    }

    fn from_connection(conn: Connection, config: SqliteConfig) -> Result<Self, StoreError> {
        Self::init_connection(&conn, &config)?;
        Self::create_schema(&conn)?;
        let local_id = Self::load_local_id(&conn, config.local_id)?;
        tracing::debug!(%local_id, kind = %K::KIND, "opened sqlite replication store");
        Ok(Self {
            conn: Mutex::new(conn),
            local_id,
            _kind: PhantomData,
        })
    }

    fn init_connection(conn: &Connection, config: &SqliteConfig) -> Result<(), StoreError> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA busy_timeout = {};
             PRAGMA page_size = {};
             PRAGMA synchronous = NORMAL;",
            config.journal_mode.as_str(),
            config.busy_timeout_ms,
            config.page_size,
        ))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS replikit_meta (
                name        TEXT PRIMARY KEY,
                value       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS replikit_items (
                kind        TEXT NOT NULL,
                key         TEXT NOT NULL,
                state       INTEGER NOT NULL,
                data        BLOB,
                metadata    TEXT NOT NULL,
                etag        INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (kind, key)
            );",
        )?;
        Ok(())
    }

    fn load_local_id(conn: &Connection, preferred: Option<String>) -> Result<String, StoreError> {
        if let Some(existing) = read_meta(conn, LOCAL_ID)? {
            return Ok(existing);
        }
        let local_id = preferred.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        write_meta(conn, LOCAL_ID, &local_id)?;
        tracing::info!(%local_id, "assigned local id");
        Ok(local_id)
    }

    /// All stored keys of this kind in order, shadows and tombstones included.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM replikit_items WHERE kind = ?1 ORDER BY key")?;
        let keys: Vec<String> = stmt
            .query_map(params![K::KIND.as_str()], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(keys)
    }

    /// Current journal mode as reported by SQLite.
    pub fn journal_mode(&self) -> Result<String, StoreError> {
        let conn = self.conn.lock();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        Ok(mode)
    }
}

impl<K: EntityKind> std::fmt::Debug for SqliteStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("local_id", &self.local_id)
            .field("kind", &K::KIND)
            .finish_non_exhaustive()
    }
}

fn read_meta(conn: &Connection, name: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM replikit_meta WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn write_meta(conn: &Connection, name: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO replikit_meta (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}

fn read_counter(conn: &Connection, name: &'static str) -> Result<u64, StoreError> {
    match read_meta(conn, name)? {
        Some(value) => value.parse().map_err(|e| StoreError::decode(name, e)),
        None => Ok(0),
    }
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %e, "sqlite rollback failed");
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl<K: EntityKind> Transactional for SqliteStore<K> {
    type Kind = K;
    type Txn<'s> = SqliteTxn<'s, K>;

    fn local_id(&self) -> &str {
        &self.local_id
    }

    fn transaction<'s, R, E>(
        &'s self,
        f: impl FnOnce(&mut SqliteTxn<'s, K>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(StoreError::from)?;
        let counters = read_counter(&conn, LAST_ETAG)
            .and_then(|etag| Ok((etag, read_counter(&conn, LAST_VERSION)?)));
        let (last_etag, last_version) = match counters {
            Ok(counters) => counters,
            Err(e) => {
                rollback(&conn);
                return Err(e.into());
            }
        };

        let mut txn = SqliteTxn {
            conn,
            local_id: &self.local_id,
            next_etag: last_etag,
            next_version: last_version,
            post_commit: PostCommit::new(),
            open: true,
            _kind: PhantomData,
        };
        match f(&mut txn) {
            Ok(result) => {
                let post_commit = txn.commit()?;
                drop(txn);
                post_commit.run();
                Ok(result)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }
}

/// An open [`SqliteStore`] transaction.
///
/// Dropped without a commit, for instance while unwinding from a panic in
/// the closure, it rolls back.
pub struct SqliteTxn<'s, K: EntityKind> {
    conn: MutexGuard<'s, Connection>,
    local_id: &'s str,
    next_etag: u64,
    next_version: u64,
    post_commit: PostCommit,
    open: bool,
    _kind: PhantomData<fn() -> K>,
}

impl<'s, K: EntityKind> SqliteTxn<'s, K> {
    /// Persist counters and commit. Hands back the queued post-commit actions.
    fn commit(&mut self) -> Result<PostCommit, StoreError> {
        self.open = false;
        let post_commit = std::mem::take(&mut self.post_commit);
        let committed = write_meta(&self.conn, LAST_ETAG, &self.next_etag.to_string())
            .and_then(|()| write_meta(&self.conn, LAST_VERSION, &self.next_version.to_string()))
            .and_then(|()| self.conn.execute_batch("COMMIT").map_err(StoreError::from));
        if let Err(e) = committed {
            tracing::error!(error = %e, "sqlite commit failed");
            rollback(&self.conn);
            post_commit.discard();
            return Err(e);
        }
        Ok(post_commit)
    }

    fn rollback(mut self) {
        tracing::warn!("sqlite transaction rolled back");
        self.open = false;
        rollback(&self.conn);
        std::mem::take(&mut self.post_commit).discard();
    }
}

impl<K: EntityKind> Drop for SqliteTxn<'_, K> {
    fn drop(&mut self) {
        if self.open {
            tracing::warn!("sqlite transaction abandoned, rolling back");
            rollback(&self.conn);
        }
    }
}

impl<K: EntityKind> RecordBackend for SqliteTxn<'_, K> {
    type Internal = K::Internal;

    fn read(&mut self, key: &str) -> Result<Option<ExistingItem<K::Internal>>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT state, data, metadata, etag FROM replikit_items
                 WHERE kind = ?1 AND key = ?2",
                params![K::KIND.as_str(), key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((state, data, metadata, etag)) = row else {
            return Ok(None);
        };

        let metadata: Metadata =
            serde_json::from_str(&metadata).map_err(|e| StoreError::decode("metadata", e))?;
        let data = data.unwrap_or_default();
        let payload = match state {
            STATE_DATA => StoredPayload::Data(K::decode(&data)?),
            STATE_MARKER => StoredPayload::ConflictMarker(
                serde_json::from_slice::<ConflictMarker>(&data)
                    .map_err(|e| StoreError::decode("conflict marker", e))?,
            ),
            STATE_TOMBSTONE => StoredPayload::Tombstone,
            other => {
                return Err(StoreError::decode(
                    "record state",
                    format!("unknown state {other} for {key}"),
                ))
            }
        };
        Ok(Some(ExistingItem {
            payload,
            etag: Etag(etag as u64),
            metadata,
        }))
    }

    fn write(
        &mut self,
        key: &str,
        payload: StoredPayload<K::Internal>,
        metadata: Metadata,
    ) -> Result<Etag, StoreError> {
        let (state, data) = match &payload {
            StoredPayload::Data(data) => (STATE_DATA, Some(K::encode(data)?)),
            StoredPayload::ConflictMarker(marker) => (
                STATE_MARKER,
                Some(
                    serde_json::to_vec(marker)
                        .map_err(|e| StoreError::encode("conflict marker", e))?,
                ),
            ),
            StoredPayload::Tombstone => (STATE_TOMBSTONE, None),
        };
        let metadata =
            serde_json::to_string(&metadata).map_err(|e| StoreError::encode("metadata", e))?;

        self.next_etag += 1;
        let etag = Etag(self.next_etag);
        self.conn.execute(
            "INSERT INTO replikit_items (kind, key, state, data, metadata, etag, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(kind, key) DO UPDATE SET
                state = excluded.state,
                data = excluded.data,
                metadata = excluded.metadata,
                etag = excluded.etag,
                updated_at = excluded.updated_at",
            params![
                K::KIND.as_str(),
                key,
                state,
                data,
                metadata,
                etag.0 as i64,
                now_ms() as i64
            ],
        )?;
        Ok(etag)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM replikit_items WHERE kind = ?1 AND key = ?2",
            params![K::KIND.as_str(), key],
        )?;
        Ok(())
    }
}

impl<K: EntityKind> LocalVersions for SqliteTxn<'_, K> {
    fn next_local_version(&mut self) -> Result<u64, StoreError> {
        self.next_version += 1;
        Ok(self.next_version)
    }
}

impl<K: EntityKind> ReplicationStorage for SqliteTxn<'_, K> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{CounterKind, DocumentKind, FileKind};
    use serde_json::json;

    fn test_store() -> SqliteStore<DocumentKind> {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn put_get_delete() {
        let store = test_store();
        store
            .transaction(|txn| {
                txn.add_without_conflict("k1", None, &Metadata::new("x", 1), json!({"a": 1}))
            })
            .unwrap();
        let item = store.get("k1").unwrap().unwrap();
        assert_eq!(item.data(), Some(&json!({"a": 1})));
        assert_eq!(item.metadata.identity().unwrap().to_string(), "x:1");

        store.transaction(|txn| txn.delete_item("k1", Some(item.etag))).unwrap();
        assert!(store.get("k1").unwrap().is_none());
    }

    #[test]
    fn markers_and_tombstones_round_trip() {
        let store = test_store();
        let record = store
            .transaction(|txn| {
                txn.add_without_conflict("k", None, &Metadata::new("a", 1), json!("local"))?;
                let existing = txn.try_get_existing("k")?.unwrap();
                txn.mark_as_deleted("k/conflicts/b", &Metadata::new("b", 1).as_conflict_side())?;
                txn.create_conflict("k", "k/conflicts/b", "k/conflicts/a", &existing)
            })
            .unwrap();

        let marker = store.get("k").unwrap().unwrap();
        assert!(marker.is_conflict_marker());
        assert_eq!(marker.etag, record.etag);
        assert_eq!(
            marker.marker().unwrap().conflicts,
            vec!["k/conflicts/a", "k/conflicts/b"]
        );

        let remote = store.get("k/conflicts/b").unwrap().unwrap();
        assert!(remote.is_tombstone());
        assert!(remote.metadata.conflict_document);

        let local = store.get("k/conflicts/a").unwrap().unwrap();
        assert_eq!(local.data(), Some(&json!("local")));
    }

    #[test]
    fn panicking_closure_leaves_the_connection_usable() {
        let store = test_store();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), StoreError> = store.transaction(|txn| {
                txn.add_without_conflict("k", None, &Metadata::new("x", 1), json!(1))?;
                panic!("trigger failed hard");
            });
        }));
        assert!(unwound.is_err());
        assert!(store.get("k").unwrap().is_none());

        store
            .transaction(|txn| txn.add_without_conflict("k", None, &Metadata::new("x", 2), json!(2)))
            .unwrap();
        assert_eq!(store.get("k").unwrap().unwrap().data(), Some(&json!(2)));
    }

    #[test]
    fn rollback_discards_writes() {
        let store = test_store();
        let out: Result<(), StoreError> = store.transaction(|txn| {
            txn.add_without_conflict("k", None, &Metadata::new("x", 1), json!(1))?;
            Err(StoreError::NotConflicted { key: "k".into() })
        });
        assert!(out.is_err());
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn identity_and_counters_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");

        let (local_id, first) = {
            let store = SqliteStore::<DocumentKind>::open(&path).unwrap();
            let etag = store
                .transaction(|txn| {
                    txn.add_without_conflict("k", None, &Metadata::new("x", 1), json!(1))
                })
                .unwrap();
            (store.local_id().to_owned(), etag)
        };

        let store = SqliteStore::<DocumentKind>::open(&path).unwrap();
        assert_eq!(store.local_id(), local_id);
        let second = store
            .transaction(|txn| txn.add_without_conflict("j", None, &Metadata::new("x", 2), json!(2)))
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn configured_local_id_is_used_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let config = SqliteConfig {
            local_id: Some("node-a".into()),
            ..SqliteConfig::default()
        };
        let store = SqliteStore::<DocumentKind>::open_with_config(&path, config).unwrap();
        assert_eq!(store.local_id(), "node-a");
        drop(store);

        let config = SqliteConfig {
            local_id: Some("node-b".into()),
            ..SqliteConfig::default()
        };
        let store = SqliteStore::<DocumentKind>::open_with_config(&path, config).unwrap();
        assert_eq!(store.local_id(), "node-a");
    }

    #[test]
    fn kinds_sharing_a_file_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let docs = SqliteStore::<DocumentKind>::open(&path).unwrap();
        docs.transaction(|txn| txn.add_without_conflict("k", None, &Metadata::new("x", 1), json!(1)))
            .unwrap();

        let files = SqliteStore::<FileKind>::open(&path).unwrap();
        assert!(files.get("k").unwrap().is_none());
        files
            .transaction(|txn| {
                txn.add_without_conflict("k", None, &Metadata::new("x", 2), b"bytes".to_vec())
            })
            .unwrap();
        assert_eq!(files.get("k").unwrap().unwrap().data().unwrap().len(), 5);
        assert_eq!(docs.get("k").unwrap().unwrap().data(), Some(&json!(1)));

        let counters = SqliteStore::<CounterKind>::open(&path).unwrap();
        assert!(counters.keys().unwrap().is_empty());
    }
}
