//! SQLite-backed operation log.
//!
//! Operations are stored as JSON bodies next to the columns the store
//! filters on. Snapshot, clock and identity live in a key/value `meta` table.
//! Every mutating call runs in its own transaction.

use crate::entry::{EntryStatus, LogEntry, OpOrigin, StateSnapshot};
use crate::error::{StoreError, StoreResult};
use crate::operation::Operation;
use crate::store::OperationLogStore;
use opsync_clock::VectorClock;
use opsync_types::{ClientId, OpId};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const META_SNAPSHOT: &str = "snapshot";
const META_CLOCK: &str = "vector_clock";
const META_PROTECTED: &str = "protected_client_ids";
const META_CLIENT_ID: &str = "client_id";
const META_LAST_SERVER_SEQ: &str = "last_server_seq";

/// Persistent operation log backed by SQLite.
pub struct SqliteOpLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOpLogStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!("Opened operation log at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ops (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL UNIQUE,
                origin TEXT NOT NULL,
                status TEXT NOT NULL,
                is_full_state INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ops_status ON ops(status);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn insert(tx: &Transaction<'_>, op: &Operation, origin: OpOrigin) -> StoreResult<u64> {
        let id = op.id.to_string();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO ops (op_id, origin, status, is_full_state, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                origin.as_str(),
                origin.initial_status().as_str(),
                op.is_full_state(),
                serde_json::to_string(op)?,
            ],
        )?;
        let seq: i64 = if inserted == 0 {
            tx.query_row("SELECT seq FROM ops WHERE op_id = ?1", params![id], |r| r.get(0))?
        } else {
            tx.last_insert_rowid()
        };
        to_u64(seq)
    }

    fn query_entries(&self, sql: &str, args: impl rusqlite::Params) -> StoreResult<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, origin, status, body) = row?;
            entries.push(LogEntry {
                seq: to_u64(seq)?,
                op: serde_json::from_str(&body)?,
                origin: origin.parse()?,
                status: status.parse()?,
            });
        }
        Ok(entries)
    }

    fn set_status(&self, ids: &[OpId], status: EntryStatus) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE ops SET status = ?1 WHERE op_id = ?2")?;
            for id in ids {
                stmt.execute(params![status.as_str(), id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_meta<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(Into::into)
    }

    fn put_meta<T: Serialize>(conn: &Connection, key: &str, value: &T) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    fn set_meta<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let conn = self.lock()?;
        Self::put_meta(&conn, key, value)
    }
}

fn to_u64(v: i64) -> StoreResult<u64> {
    u64::try_from(v).map_err(|_| StoreError::InvalidData(format!("negative sequence: {v}")))
}

fn to_i64(v: u64) -> StoreResult<i64> {
    i64::try_from(v).map_err(|_| StoreError::InvalidData(format!("sequence out of range: {v}")))
}

impl OperationLogStore for SqliteOpLogStore {
    fn append(&self, op: &Operation, origin: OpOrigin) -> StoreResult<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let seq = Self::insert(&tx, op, origin)?;
        tx.commit()?;
        Ok(seq)
    }

    fn append_with_clock_update(&self, op: &Operation, origin: OpOrigin) -> StoreResult<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let seq = Self::insert(&tx, op, origin)?;

        let stored: Option<String> = tx
            .query_row("SELECT value FROM meta WHERE key = ?1", params![META_CLOCK], |r| r.get(0))
            .optional()?;
        let mut clock: VectorClock = match stored {
            Some(s) => serde_json::from_str(&s)?,
            None => VectorClock::new(),
        };
        clock.merge(&op.vector_clock);
        Self::put_meta(&tx, META_CLOCK, &clock)?;

        tx.commit()?;
        Ok(seq)
    }

    fn get_ops_after_seq(&self, after: u64) -> StoreResult<Vec<LogEntry>> {
        self.query_entries(
            "SELECT seq, origin, status, body FROM ops WHERE seq > ?1 ORDER BY seq",
            params![to_i64(after)?],
        )
    }

    fn get_unsynced_ops(&self) -> StoreResult<Vec<LogEntry>> {
        self.query_entries(
            "SELECT seq, origin, status, body FROM ops WHERE status = ?1 ORDER BY seq",
            params![EntryStatus::Pending.as_str()],
        )
    }

    fn get_entry(&self, id: &OpId) -> StoreResult<Option<LogEntry>> {
        Ok(self
            .query_entries(
                "SELECT seq, origin, status, body FROM ops WHERE op_id = ?1",
                params![id.to_string()],
            )?
            .into_iter()
            .next())
    }

    fn has_op(&self, id: &OpId) -> StoreResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM ops WHERE op_id = ?1", params![id.to_string()], |r| r.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn mark_synced(&self, ids: &[OpId]) -> StoreResult<()> {
        self.set_status(ids, EntryStatus::Synced)
    }

    fn mark_rejected(&self, ids: &[OpId]) -> StoreResult<()> {
        self.set_status(ids, EntryStatus::Rejected)
    }

    fn mark_superseded(&self, ids: &[OpId]) -> StoreResult<()> {
        self.set_status(ids, EntryStatus::Superseded)
    }

    fn clear_unsynced_ops(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM ops WHERE status = ?1",
            params![EntryStatus::Pending.as_str()],
        )?)
    }

    fn clear_full_state_ops(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM ops WHERE is_full_state = 1", [])?)
    }

    fn clear_all_operations(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM ops", [])?;
        Ok(())
    }

    fn delete_synced_ops_up_to(&self, up_to: u64) -> StoreResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM ops WHERE seq <= ?1 AND status != ?2",
            params![to_i64(up_to)?, EntryStatus::Pending.as_str()],
        )?)
    }

    fn load_snapshot(&self) -> StoreResult<Option<StateSnapshot>> {
        self.get_meta(META_SNAPSHOT)
    }

    fn save_snapshot(&self, snapshot: &StateSnapshot) -> StoreResult<()> {
        self.set_meta(META_SNAPSHOT, snapshot)
    }

    fn get_last_seq(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let seq: Option<i64> = conn
            .query_row("SELECT seq FROM sqlite_sequence WHERE name = 'ops'", [], |r| r.get(0))
            .optional()?;
        to_u64(seq.unwrap_or(0))
    }

    fn get_vector_clock(&self) -> StoreResult<VectorClock> {
        Ok(self.get_meta(META_CLOCK)?.unwrap_or_default())
    }

    fn set_vector_clock(&self, clock: &VectorClock) -> StoreResult<()> {
        self.set_meta(META_CLOCK, clock)
    }

    fn get_protected_client_ids(&self) -> StoreResult<BTreeSet<ClientId>> {
        Ok(self.get_meta(META_PROTECTED)?.unwrap_or_default())
    }

    fn set_protected_client_ids(&self, ids: &BTreeSet<ClientId>) -> StoreResult<()> {
        self.set_meta(META_PROTECTED, ids)
    }

    fn get_client_id(&self) -> StoreResult<Option<ClientId>> {
        self.get_meta(META_CLIENT_ID)
    }

    fn set_client_id(&self, id: &ClientId) -> StoreResult<()> {
        self.set_meta(META_CLIENT_ID, id)
    }

    fn get_last_server_seq(&self) -> StoreResult<u64> {
        Ok(self.get_meta(META_LAST_SERVER_SEQ)?.unwrap_or(0))
    }

    fn set_last_server_seq(&self, seq: u64) -> StoreResult<()> {
        self.set_meta(META_LAST_SERVER_SEQ, &seq)
    }
}
