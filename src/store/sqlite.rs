//! SQLite-backed local store
//!
//! One row per collection key holding the JSON-encoded record sequence.
//! Each save is a single upsert inside a transaction, so a failed write leaves
//! the previous contents untouched.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{LocalStore, StoreKey};
use crate::error::{Result, SyncError};

/// Durable [`LocalStore`] backed by a SQLite file
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create `tracker.db` inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| SyncError::Storage(format!("creating {}: {}", data_dir.display(), e)))?;
        let db_path = data_dir.join("tracker.db");
        let db = Connection::open(&db_path)?;

        // WAL keeps readers unblocked while a save commits
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::migrate(&db)?;

        info!(path = %db_path.display(), "Local store initialized");
        Ok(Self { db: Mutex::new(db) })
    }

    /// Open a throwaway in-memory database
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::migrate(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn migrate(db: &Connection) -> Result<()> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS collections (
                store_key TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                scope TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            CREATE TABLE IF NOT EXISTS markers (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SyncError::Storage("store connection lock poisoned".into()))
    }
}

impl LocalStore for SqliteStore {
    fn save(&self, key: &StoreKey, records: &[serde_json::Value]) -> Result<()> {
        let payload = serde_json::to_string(records)?;
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO collections (store_key, collection, scope, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))
             ON CONFLICT(store_key) DO UPDATE SET payload = ?4, updated_at = strftime('%s', 'now')",
            params![
                key.to_string(),
                key.collection.as_str(),
                key.scope.as_str(),
                payload
            ],
        )?;
        tx.commit()?;
        debug!(key = %key, records = records.len(), "Saved collection");
        Ok(())
    }

    fn load(&self, key: &StoreKey) -> Result<Option<Vec<serde_json::Value>>> {
        let db = self.conn()?;
        let payload: Option<String> = db
            .query_row(
                "SELECT payload FROM collections WHERE store_key = ?1",
                [key.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn clear_all(&self) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM collections", [])?;
        tx.execute("DELETE FROM markers", [])?;
        tx.commit()?;
        info!("Local store cleared");
        Ok(())
    }

    fn save_marker(&self, name: &str, value: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO markers (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = ?2",
            params![name, value],
        )?;
        Ok(())
    }

    fn load_marker(&self, name: &str) -> Result<Option<String>> {
        let db = self.conn()?;
        let value = db
            .query_row("SELECT value FROM markers WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}
