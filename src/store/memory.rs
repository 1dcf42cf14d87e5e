//! In-memory store for tests, with failure injection

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{LocalStore, StoreKey};
use crate::error::{Result, SyncError};

/// Volatile [`LocalStore`]. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    markers: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("injected write failure".into()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("injected read failure".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn save(&self, key: &StoreKey, records: &[serde_json::Value]) -> Result<()> {
        self.check_write()?;
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".into()))?;
        collections.insert(key.to_string(), records.to_vec());
        Ok(())
    }

    fn load(&self, key: &StoreKey) -> Result<Option<Vec<serde_json::Value>>> {
        self.check_read()?;
        let collections = self
            .collections
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".into()))?;
        Ok(collections.get(&key.to_string()).cloned())
    }

    fn clear_all(&self) -> Result<()> {
        self.check_write()?;
        self.collections
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".into()))?
            .clear();
        self.markers
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".into()))?
            .clear();
        Ok(())
    }

    fn save_marker(&self, name: &str, value: &str) -> Result<()> {
        self.check_write()?;
        self.markers
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".into()))?
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn load_marker(&self, name: &str) -> Result<Option<String>> {
        self.check_read()?;
        let markers = self
            .markers
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".into()))?;
        Ok(markers.get(name).cloned())
    }
}
