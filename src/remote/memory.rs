//! In-memory backend for tests and demos
//!
//! Behaves like the hosted backend (server-assigned ids, per-scope rows, a
//! ledger per scope) and adds knobs for the failure modes the engine has to
//! survive: going offline, failing the next write, failing ledger calls, and
//! holding writes in flight until released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use super::RemoteBackend;
use crate::error::{Result, SyncError};
use crate::model::{Collection, Entity, EntityId, HistoryEntry, LedgerDelta, PointsLedger, Scope};

#[derive(Default)]
struct ServerState {
    rows: HashMap<(Collection, Scope), Vec<Entity>>,
    ledgers: HashMap<Scope, PointsLedger>,
    history: Vec<HistoryEntry>,
}

/// [`RemoteBackend`] held in process memory
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<ServerState>,
    next_id: AtomicU64,
    offline: AtomicBool,
    fail_ledger: AtomicBool,
    queued_failures: Mutex<VecDeque<SyncError>>,
    held: AtomicBool,
    release: Notify,
    in_flight: AtomicUsize,
    ledger_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mint_id(&self) -> EntityId {
        EntityId::new(format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    // ==================== Failure injection ====================

    /// Fail every call with a network error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next write call with `error`
    pub fn fail_next(&self, error: SyncError) {
        self.queued_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(error);
    }

    /// Fail every ledger delta call until switched back
    pub fn set_fail_ledger(&self, fail: bool) {
        self.fail_ledger.store(fail, Ordering::SeqCst);
    }

    /// Park every write call at the gate until [`Self::release`] is called
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Writes currently parked at the gate
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` writes are parked at the gate
    pub async fn wait_for_in_flight(&self, count: usize) {
        while self.in_flight() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub fn ledger_calls(&self) -> usize {
        self.ledger_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Network("backend unreachable".into()));
        }
        Ok(())
    }

    /// Gate shared by every write: hold, then offline, then queued failures
    async fn admit_write(&self) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        loop {
            let released = self.release.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.check_online()?;
        let queued = self
            .queued_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match queued {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    // ==================== Server-side edits ====================

    /// Write a row directly, as another device would. Returns the stored row.
    pub fn server_upsert(&self, mut entity: Entity) -> Entity {
        if entity.id().is_empty() || entity.id().is_optimistic() {
            entity.set_id(self.mint_id());
        }
        let mut state = self.lock();
        let rows = state
            .rows
            .entry((entity.collection(), entity.owner_scope().clone()))
            .or_default();
        match rows.iter().position(|e| e.id() == entity.id()) {
            Some(i) => rows[i] = entity.clone(),
            None => rows.push(entity.clone()),
        }
        entity
    }

    pub fn server_remove(&self, collection: Collection, scope: &Scope, id: &EntityId) {
        if let Some(rows) = self.lock().rows.get_mut(&(collection, scope.clone())) {
            rows.retain(|e| e.id() != id);
        }
    }

    pub fn server_set_ledger(&self, ledger: PointsLedger) {
        self.lock().ledgers.insert(ledger.owner_scope.clone(), ledger);
    }

    pub fn server_entity(&self, collection: Collection, scope: &Scope, id: &EntityId) -> Option<Entity> {
        self.lock()
            .rows
            .get(&(collection, scope.clone()))
            .and_then(|rows| rows.iter().find(|e| e.id() == id).cloned())
    }

    pub fn server_rows(&self, collection: Collection, scope: &Scope) -> Vec<Entity> {
        self.lock()
            .rows
            .get(&(collection, scope.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn server_ledger(&self, scope: &Scope) -> PointsLedger {
        self.lock()
            .ledgers
            .get(scope)
            .cloned()
            .unwrap_or_else(|| PointsLedger::empty(scope.clone()))
    }

    pub fn server_history(&self, scope: &Scope) -> Vec<HistoryEntry> {
        self.lock()
            .history
            .iter()
            .filter(|e| &e.owner_scope == scope)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn fetch_collection(&self, collection: Collection, scope: &Scope) -> Result<Vec<Entity>> {
        self.check_online()?;
        Ok(self.server_rows(collection, scope))
    }

    async fn fetch_entity(
        &self,
        collection: Collection,
        scope: &Scope,
        id: &EntityId,
    ) -> Result<Option<Entity>> {
        self.check_online()?;
        Ok(self.server_entity(collection, scope, id))
    }

    async fn fetch_ledger(&self, scope: &Scope) -> Result<PointsLedger> {
        self.check_online()?;
        Ok(self.server_ledger(scope))
    }

    async fn fetch_history(&self, scope: &Scope) -> Result<Vec<HistoryEntry>> {
        self.check_online()?;
        Ok(self.server_history(scope))
    }

    async fn insert(&self, entity: &Entity) -> Result<Entity> {
        self.admit_write().await?;
        let mut stored = entity.clone();
        stored.set_id(self.mint_id());
        stored.touch(Utc::now());
        Ok(self.server_upsert(stored))
    }

    async fn update(&self, entity: &Entity) -> Result<Entity> {
        self.admit_write().await?;
        let collection = entity.collection();
        if self
            .server_entity(collection, entity.owner_scope(), entity.id())
            .is_none()
        {
            return Err(SyncError::NotFound(format!("{}/{}", collection, entity.id())));
        }
        let mut stored = entity.clone();
        stored.touch(Utc::now());
        Ok(self.server_upsert(stored))
    }

    async fn delete(&self, collection: Collection, scope: &Scope, id: &EntityId) -> Result<()> {
        self.admit_write().await?;
        self.server_remove(collection, scope, id);
        Ok(())
    }

    async fn batch_update(&self, entities: &[Entity]) -> Result<()> {
        self.admit_write().await?;
        for entity in entities {
            self.server_upsert(entity.clone());
        }
        Ok(())
    }

    async fn apply_ledger_delta(&self, scope: &Scope, delta: LedgerDelta) -> Result<PointsLedger> {
        self.admit_write().await?;
        if self.fail_ledger.load(Ordering::SeqCst) {
            return Err(SyncError::Network("ledger update failed".into()));
        }
        self.ledger_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        let ledger = state
            .ledgers
            .entry(scope.clone())
            .or_insert_with(|| PointsLedger::empty(scope.clone()));
        *ledger = ledger.applied(delta);
        Ok(ledger.clone())
    }

    async fn insert_history(&self, entry: &HistoryEntry) -> Result<HistoryEntry> {
        self.admit_write().await?;
        let mut stored = entry.clone();
        stored.id = self.mint_id();
        self.lock().history.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use std::sync::Arc;

    fn task(title: &str) -> Entity {
        Entity::Task(Task {
            id: EntityId::optimistic(),
            owner_scope: "u1".into(),
            title: title.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_insert_assigns_server_id() {
        let backend = InMemoryBackend::new();
        let stored = backend.insert(&task("a")).await.unwrap();
        assert_eq!(stored.id().as_str(), "srv-1");
        assert_eq!(backend.server_rows(Collection::Tasks, &"u1".into()).len(), 1);
    }

    #[tokio::test]
    async fn test_queued_failure_hits_next_write_only() {
        let backend = InMemoryBackend::new();
        backend.fail_next(SyncError::Validation("title required".into()));

        assert!(matches!(
            backend.insert(&task("a")).await,
            Err(SyncError::Validation(_))
        ));
        assert!(backend.insert(&task("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_hold_parks_writes_until_released() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.hold();

        let writer = backend.clone();
        let handle = tokio::spawn(async move { writer.insert(&task("a")).await });
        backend.wait_for_in_flight(1).await;
        assert!(backend.server_rows(Collection::Tasks, &"u1".into()).is_empty());

        backend.release();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(backend.in_flight(), 0);
    }
}
