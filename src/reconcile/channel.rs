//! Push-driven reconciliation loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheValue, QueryCache, QueryKey, RemoteOutcome, RemoteWrite};
use crate::error::{Result, SyncError};
use crate::model::{Collection, Entity, PointsLedger};
use crate::remote::{self, ChangeType, RemoteBackend, RemoteChange};
use crate::store::CollectionWriter;

/// Event delivered by the push transport
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Change(RemoteChange),
    Connected,
    Disconnected,
}

/// Result of resyncing every subscribed key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub applied: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// Merges out-of-band server changes into the cache
pub struct ReconcileChannel {
    cache: Arc<QueryCache>,
    writer: Arc<CollectionWriter>,
    backend: Arc<dyn RemoteBackend>,
    timeout: Duration,
    connected: AtomicBool,
}

impl ReconcileChannel {
    pub fn new(
        cache: Arc<QueryCache>,
        writer: Arc<CollectionWriter>,
        backend: Arc<dyn RemoteBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            writer,
            backend,
            timeout,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drive the channel until the transport closes its sender
    pub async fn run(&self, mut events: mpsc::Receiver<ChannelEvent>) {
        info!("Reconciliation channel started");
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("Reconciliation channel closed");
    }

    pub async fn handle(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Change(change) => {
                if let Err(e) = self.apply_change(&change).await {
                    warn!(
                        collection = %change.collection,
                        entity_id = %change.entity_id,
                        error = %e,
                        "Failed to apply remote change"
                    );
                }
            }
            ChannelEvent::Disconnected => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!("Push transport disconnected, serving cached data");
                }
            }
            ChannelEvent::Connected => {
                let was_connected = self.connected.swap(true, Ordering::SeqCst);
                if !was_connected {
                    let report = self.resync().await;
                    info!(
                        applied = report.applied,
                        deferred = report.deferred,
                        failed = report.failed,
                        "Resynced after reconnect"
                    );
                }
            }
        }
    }

    /// Apply one change. Re-applying the same change is harmless.
    pub async fn apply_change(&self, change: &RemoteChange) -> Result<RemoteOutcome> {
        let key = change.key();
        debug!(key = %key, entity_id = %change.entity_id, change_type = ?change.change_type, "Remote change");

        let write = match change.collection {
            Collection::Points => RemoteWrite::Replace(CacheValue::Ledger(self.ledger_for(change).await?)),
            // history rows are append-only; pull the log
            Collection::History => return self.resync_key(&key).await,
            collection => match change.change_type {
                ChangeType::Delete => RemoteWrite::Remove(change.entity_id.clone()),
                ChangeType::Insert | ChangeType::Update => match self.entity_for(collection, change).await? {
                    Some(entity) => RemoteWrite::Upsert(entity),
                    None => RemoteWrite::Remove(change.entity_id.clone()),
                },
            },
        };

        let outcome = self.cache.apply_remote(&key, write);
        if outcome == RemoteOutcome::Applied {
            self.persist(&key).await;
        } else {
            debug!(key = %key, entity_id = %change.entity_id, "Deferred until in-flight mutation settles");
        }
        Ok(outcome)
    }

    /// Refetch every subscribed key
    pub async fn resync(&self) -> ResyncReport {
        let mut report = ResyncReport::default();
        for key in self.cache.subscribed_keys() {
            match self.resync_key(&key).await {
                Ok(RemoteOutcome::Applied) => report.applied += 1,
                Ok(RemoteOutcome::Deferred) => report.deferred += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Resync failed, keeping cached value");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Replace one key with the server's value, deferred while it has pins
    pub async fn resync_key(&self, key: &QueryKey) -> Result<RemoteOutcome> {
        let value = self.bounded(remote::fetch_value(self.backend.as_ref(), key)).await?;
        let outcome = self.cache.apply_remote(key, RemoteWrite::Replace(value));
        if outcome == RemoteOutcome::Applied {
            self.persist(key).await;
        }
        Ok(outcome)
    }

    async fn entity_for(&self, collection: Collection, change: &RemoteChange) -> Result<Option<Entity>> {
        match &change.record {
            Some(record) => Entity::from_record(collection, record.clone()).map(Some),
            None => {
                self.bounded(self.backend.fetch_entity(collection, &change.scope, &change.entity_id))
                    .await
            }
        }
    }

    async fn ledger_for(&self, change: &RemoteChange) -> Result<PointsLedger> {
        match &change.record {
            Some(record) => Ok(serde_json::from_value(record.clone())?),
            None => self.bounded(self.backend.fetch_ledger(&change.scope)).await,
        }
    }

    async fn bounded<T>(&self, call: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| SyncError::Timeout(self.timeout.as_millis() as u64))?
    }

    async fn persist(&self, key: &QueryKey) {
        self.writer.persist(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::model::{EntityId, Rule, Scope};
    use crate::remote::InMemoryBackend;
    use crate::store::{LocalStore, MemoryStore};

    fn setup() -> (Arc<QueryCache>, Arc<MemoryStore>, Arc<InMemoryBackend>, ReconcileChannel) {
        let cache = Arc::new(QueryCache::new(CacheConfig::default()));
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(InMemoryBackend::new());
        let channel = ReconcileChannel::new(
            cache.clone(),
            Arc::new(CollectionWriter::new(cache.clone(), store.clone())),
            backend.clone(),
            Duration::from_secs(5),
        );
        (cache, store, backend, channel)
    }

    fn rule(id: &str, title: &str) -> Entity {
        Entity::Rule(Rule {
            id: id.into(),
            owner_scope: "u1".into(),
            title: title.into(),
            ..Default::default()
        })
    }

    fn change(id: &str, change_type: ChangeType, record: Option<Entity>) -> RemoteChange {
        RemoteChange {
            collection: Collection::Rules,
            scope: Scope::new("u1"),
            entity_id: EntityId::new(id),
            change_type,
            record: record.map(|e| e.to_record().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_change_with_record_is_upserted_and_persisted() {
        let (cache, store, _backend, channel) = setup();
        let key = QueryKey::new(Collection::Rules, "u1".into());

        let c = change("r1", ChangeType::Insert, Some(rule("r1", "No phones")));
        assert_eq!(channel.apply_change(&c).await.unwrap(), RemoteOutcome::Applied);
        // at-least-once delivery
        channel.apply_change(&c).await.unwrap();

        assert_eq!(cache.peek(&key).unwrap().len(), 1);
        assert_eq!(store.load(&key.store_key()).unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_change_without_record_fetches_row() {
        let (cache, _store, backend, channel) = setup();
        let key = QueryKey::new(Collection::Rules, "u1".into());
        let stored = backend.server_upsert(rule("", "Bedtime"));

        channel
            .apply_change(&change(stored.id().as_str(), ChangeType::Update, None))
            .await
            .unwrap();
        assert_eq!(cache.find_entity(&key, stored.id()).unwrap().title(), "Bedtime");
    }

    #[tokio::test]
    async fn test_missing_row_is_treated_as_delete() {
        let (cache, _store, _backend, channel) = setup();
        let key = QueryKey::new(Collection::Rules, "u1".into());
        cache.set(&key, CacheValue::Entities(vec![rule("r1", "Gone")]));

        channel
            .apply_change(&change("r1", ChangeType::Update, None))
            .await
            .unwrap();
        assert!(cache.peek(&key).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_resyncs_subscribed_keys() {
        let (cache, _store, backend, channel) = setup();
        let key = QueryKey::new(Collection::Rules, "u1".into());
        cache.subscribe(&key, Arc::new(|_: &CacheValue| {}));
        backend.server_upsert(rule("r1", "From server"));

        channel.handle(ChannelEvent::Connected).await;
        assert!(channel.is_connected());
        assert_eq!(cache.peek(&key).unwrap().len(), 1);

        channel.handle(ChannelEvent::Disconnected).await;
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_run_stops_when_sender_closes() {
        let (cache, _store, _backend, channel) = setup();
        let (tx, rx) = mpsc::channel(8);
        tx.send(ChannelEvent::Change(change("r1", ChangeType::Insert, Some(rule("r1", "a")))))
            .await
            .unwrap();
        drop(tx);

        channel.run(rx).await;
        assert!(cache
            .find_entity(&QueryKey::new(Collection::Rules, "u1".into()), &"r1".into())
            .is_some());
    }
}
