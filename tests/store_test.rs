//! Durability integration tests
//!
//! Runs engines over a SQLite store in a temp directory and restarts them:
//! - confirmed state survives a restart
//! - in-flight predictions never reach the store
//! - store failures degrade durability without blocking mutations
//! - sign-out wipes everything

use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::TempDir;
use tracker_sync::cache::QueryKey;
use tracker_sync::clock::FixedClock;
use tracker_sync::model::{Collection, Entity, Frequency, Scope, Task};
use tracker_sync::mutation::EntityDraft;
use tracker_sync::remote::{ChangeType, InMemoryBackend, RemoteChange};
use tracker_sync::store::{self, LocalStore, MemoryStore, SqliteStore};
use tracker_sync::{Config, SyncContext, SyncEngine};

fn scope() -> Scope {
    Scope::new("household-1")
}

fn tasks_key() -> QueryKey {
    QueryKey::new(Collection::Tasks, scope())
}

fn engine_on(store: Arc<dyn LocalStore>, backend: Arc<InMemoryBackend>) -> Arc<SyncEngine> {
    let context = SyncContext::new(Config::default(), store, backend).with_clock(Arc::new(
        FixedClock::new(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()),
    ));
    Arc::new(SyncEngine::new(context))
}

fn sqlite(dir: &TempDir) -> Arc<dyn LocalStore> {
    Arc::new(SqliteStore::open(dir.path()).unwrap())
}

fn task(id: &str, title: &str) -> Entity {
    Entity::Task(Task {
        id: id.into(),
        owner_scope: "household-1".into(),
        title: title.into(),
        points: 5,
        frequency: Frequency::Daily,
        ..Default::default()
    })
}

fn stored_tasks(store: &dyn LocalStore) -> Vec<Entity> {
    store::load_value(store, &tasks_key().store_key())
        .and_then(|v| v.entities().map(|e| e.to_vec()))
        .unwrap_or_default()
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_confirmed_create_survives_restart_offline() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());

    let server_id = {
        let engine = engine_on(sqlite(&dir), backend.clone());
        engine.sign_in(scope()).await.unwrap();
        engine
            .executor()
            .create(&scope(), EntityDraft::task("Dishes", 10, Frequency::Daily))
            .await
            .unwrap()
            .entity
            .unwrap()
            .id()
            .clone()
    };

    backend.set_offline(true);
    let engine = engine_on(sqlite(&dir), backend.clone());
    // markers were persisted, so no reset is due
    assert!(engine.sign_in(scope()).await.unwrap().is_empty());

    let result = engine.read(Collection::Tasks).unwrap();
    let tasks = result.data.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks.entities().unwrap()[0].id(), &server_id);
    assert!(result.is_stale);
}

#[tokio::test]
async fn test_in_flight_create_is_never_persisted() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    backend.server_upsert(task("t1", "Dishes"));

    let engine = engine_on(sqlite(&dir), backend.clone());
    engine.sign_in(scope()).await.unwrap();
    engine.sync().await.unwrap();

    backend.hold();
    let creator = engine.clone();
    let pending = tokio::spawn(async move {
        creator
            .executor()
            .create(&scope(), EntityDraft::task("Phantom", 1, Frequency::Daily))
            .await
    });
    backend.wait_for_in_flight(1).await;
    assert_eq!(engine.cache().pinned_count(&tasks_key()), 1);

    // a partner edit persists the key while the create is still pending
    let edited = backend.server_upsert(task("t1", "Dishes and pans"));
    engine
        .channel()
        .apply_change(&RemoteChange {
            collection: Collection::Tasks,
            scope: scope(),
            entity_id: "t1".into(),
            change_type: ChangeType::Update,
            record: Some(edited.to_record().unwrap()),
        })
        .await
        .unwrap();

    let reopened = SqliteStore::open(dir.path()).unwrap();
    let on_disk = stored_tasks(&reopened);
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].title(), "Dishes and pans");

    // the process dies with the create unanswered
    pending.abort();
    let _ = pending.await;
    drop(engine);
    backend.release();

    let restarted = engine_on(sqlite(&dir), backend.clone());
    restarted.sign_in(scope()).await.unwrap();
    let hydrated = restarted.cache().peek(&tasks_key()).unwrap();
    assert!(hydrated.entities().unwrap().iter().all(|t| !t.id().is_optimistic()));

    restarted.sync().await.unwrap();
    let synced = restarted.cache().peek(&tasks_key()).unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced.entities().unwrap()[0].title(), "Dishes and pans");
}

#[tokio::test]
async fn test_sign_out_wipes_store() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    backend.server_upsert(task("t1", "Dishes"));

    let engine = engine_on(sqlite(&dir), backend.clone());
    engine.sign_in(scope()).await.unwrap();
    engine.sync().await.unwrap();
    assert_eq!(stored_tasks(engine.context().store.as_ref()).len(), 1);

    engine.sign_out().await.unwrap();
    assert!(engine.cache().peek(&tasks_key()).is_none());
    assert!(engine.scope().is_err());

    let store = SqliteStore::open(dir.path()).unwrap();
    assert!(store.load(&tasks_key().store_key()).unwrap().is_none());
    assert!(store
        .load_marker(&store::marker_name("lastDailyResetKey", &scope()))
        .unwrap()
        .is_none());
}

// =============================================================================
// Store failures
// =============================================================================

#[tokio::test]
async fn test_store_write_failure_does_not_block_mutation() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(InMemoryBackend::new());
    let engine = engine_on(store.clone(), backend.clone());
    engine.sign_in(scope()).await.unwrap();
    engine.sync().await.unwrap();

    store.fail_writes(true);
    let created = engine
        .executor()
        .create(&scope(), EntityDraft::task("Vacuum", 15, Frequency::Weekly))
        .await
        .unwrap();

    let cached = engine.cache().peek(&tasks_key()).unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(
        cached.entities().unwrap()[0].id(),
        created.entity.unwrap().id()
    );
    // the last successful save is still what the store holds
    assert!(stored_tasks(store.as_ref()).is_empty());
}

#[tokio::test]
async fn test_unreadable_store_starts_empty() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(
            &tasks_key().store_key(),
            &[task("t1", "Dishes").to_record().unwrap()],
        )
        .unwrap();
    store.fail_reads(true);

    let engine = engine_on(store.clone(), Arc::new(InMemoryBackend::new()));
    engine.sign_in(scope()).await.unwrap();
    assert!(engine.cache().peek(&tasks_key()).is_none());
}
