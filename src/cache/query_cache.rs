//! Reactive query cache
//!
//! Single in-memory source of truth for the presentation layer. Each key holds
//! the last known value, when it was fetched, whether it was invalidated, and
//! its subscribers.
//!
//! The cache also owns the optimistic bookkeeping so that every change to a
//! key happens under one lock:
//! - **pins**: entity slots with a mutation in flight, each holding the
//!   rollback snapshot taken when the prediction was applied
//! - **deferred**: remote changes that arrived for a pinned slot, applied once
//!   the slot settles
//! - **aliases**: retired optimistic ids and the server id that replaced them,
//!   bounded by `max_aliases` with the oldest retired first
//!
//! The state lock is never held while subscribers run or across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::key::{EntityRef, QueryKey};
use super::value::CacheValue;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::model::{Collection, Entity, EntityId, HistoryEntry};

/// Callback run synchronously whenever a key's value changes
pub type Subscriber = Arc<dyn Fn(&CacheValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Loads the server value for a key. Used for background refetches.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<CacheValue>;
}

/// What the presentation layer sees for a key
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub data: Option<CacheValue>,
    pub is_loading: bool,
    pub is_stale: bool,
    pub error: Option<String>,
}

/// Rollback snapshot for one entity slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSnapshot {
    /// Index the entity occupied before the mutation
    pub position: Option<usize>,
    /// The entity before the mutation, `None` for creates
    pub prior: Option<Entity>,
}

/// Prediction written into a slot
#[derive(Debug, Clone)]
pub enum OptimisticChange {
    Insert(Entity),
    Replace(Entity),
    Remove,
}

/// Remote change routed through the cache
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
    /// Insert or replace an entity by id
    Upsert(Entity),
    /// Remove an entity by id
    Remove(EntityId),
    /// Replace the whole value of the key
    Replace(CacheValue),
}

/// Whether a remote write landed now or waits for a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    Deferred,
}

#[derive(Default)]
struct Entry {
    value: Option<CacheValue>,
    fetched_at: Option<Instant>,
    invalidated: bool,
    /// The value was created empty by a prediction and never loaded
    materialized: bool,
    fetching: bool,
    error: Option<String>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
}

struct Pin {
    count: usize,
    snapshot: SlotSnapshot,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, Entry>,
    pins: HashMap<EntityRef, Pin>,
    deferred: HashMap<QueryKey, Vec<RemoteWrite>>,
    aliases: HashMap<EntityRef, EntityId>,
    alias_order: VecDeque<EntityRef>,
    next_subscription: u64,
}

impl CacheState {
    fn entry(&mut self, key: &QueryKey) -> &mut Entry {
        self.entries.entry(key.clone()).or_default()
    }

    fn has_pins(&self, key: &QueryKey) -> bool {
        self.pins.keys().any(|pinned| &pinned.key == key)
    }

    /// A create under `key` has not been confirmed yet
    fn has_pending_create(&self, key: &QueryKey) -> bool {
        self.pins
            .iter()
            .any(|(pinned, pin)| &pinned.key == key && pin.snapshot.prior.is_none())
    }

    fn contains(&self, key: &QueryKey, id: &EntityId) -> bool {
        self.entries
            .get(key)
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.find_entity(id))
            .is_some()
    }

    /// Whether `write` has to wait for an in-flight mutation to settle.
    ///
    /// An upsert of an unknown id waits while a create is pending, since it
    /// may be the server row of that create.
    fn blocks(&self, key: &QueryKey, write: &RemoteWrite) -> bool {
        match write {
            RemoteWrite::Upsert(entity) => {
                let id = entity.id();
                self.pins.contains_key(&key.entity(id.clone()))
                    || (!self.contains(key, id) && self.has_pending_create(key))
            }
            RemoteWrite::Remove(id) => self.pins.contains_key(&key.entity(id.clone())),
            RemoteWrite::Replace(_) => self.has_pins(key),
        }
    }

    /// Entity list for `key`, created empty if the key was never loaded
    fn entities_mut(&mut self, key: &QueryKey) -> Option<&mut Vec<Entity>> {
        let entry = self.entry(key);
        let value = entry
            .value
            .get_or_insert_with(|| CacheValue::empty_for(key.collection, &key.scope));
        value.entities_mut()
    }

    fn notification(&self, key: &QueryKey) -> Option<Notification> {
        let entry = self.entries.get(key)?;
        let value = entry.value.clone()?;
        if entry.subscribers.is_empty() {
            return None;
        }
        Some(Notification {
            value,
            subscribers: entry.subscribers.iter().map(|(_, s)| s.clone()).collect(),
        })
    }

    fn write_remote(&mut self, key: &QueryKey, write: RemoteWrite) {
        match write {
            RemoteWrite::Upsert(entity) => {
                if let Some(items) = self.entities_mut(key) {
                    match items.iter().position(|e| e.id() == entity.id()) {
                        Some(index) => items[index] = entity,
                        None => items.push(entity),
                    }
                }
            }
            RemoteWrite::Remove(id) => {
                if let Some(items) = self.entities_mut(key) {
                    items.retain(|e| e.id() != &id);
                }
            }
            RemoteWrite::Replace(value) => {
                let entry = self.entry(key);
                entry.value = Some(value);
                entry.fetched_at = Some(Instant::now());
                entry.invalidated = false;
                entry.materialized = false;
                entry.error = None;
            }
        }
    }

    /// Apply deferred writes whose target is no longer pinned.
    /// Returns whether anything was applied.
    fn drain_deferred(&mut self, key: &QueryKey) -> bool {
        let Some(queued) = self.deferred.remove(key) else {
            return false;
        };

        let mut applied = false;
        let mut still_waiting = Vec::new();
        for write in queued {
            if self.blocks(key, &write) {
                still_waiting.push(write);
                continue;
            }

            let is_replace = matches!(write, RemoteWrite::Replace(_));
            self.write_remote(key, write);
            if is_replace {
                // fetched before the settlement, so refetch on next read
                self.entry(key).invalidated = true;
            }
            applied = true;
        }

        if !still_waiting.is_empty() {
            self.deferred.insert(key.clone(), still_waiting);
        }
        applied
    }

    fn retire(&mut self, slot: EntityRef, server_id: EntityId, max: usize) {
        if self.aliases.insert(slot.clone(), server_id).is_none() {
            self.alias_order.push_back(slot);
        }
        while self.alias_order.len() > max {
            if let Some(oldest) = self.alias_order.pop_front() {
                self.aliases.remove(&oldest);
            }
        }
    }

    fn unpin(&mut self, slot: &EntityRef) -> Option<SlotSnapshot> {
        let pin = self.pins.get_mut(slot)?;
        pin.count -= 1;
        if pin.count > 0 {
            return Some(pin.snapshot.clone());
        }
        self.pins.remove(slot).map(|pin| pin.snapshot)
    }
}

struct Notification {
    value: CacheValue,
    subscribers: Vec<Subscriber>,
}

impl Notification {
    fn deliver(self) {
        for subscriber in &self.subscribers {
            subscriber(&self.value);
        }
    }
}

/// In-memory, subscription-based cache keyed by [`QueryKey`].
///
/// Clone the surrounding `Arc` to share it; separate instances are fully
/// isolated, which is what tests and multi-account setups rely on.
pub struct QueryCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    fetcher: RwLock<Option<Arc<dyn QueryFetcher>>>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            fetcher: RwLock::new(None),
        }
    }

    /// Register the loader used for background refetches
    pub fn set_fetcher(&self, fetcher: Arc<dyn QueryFetcher>) {
        if let Ok(mut slot) = self.fetcher.write() {
            *slot = Some(fetcher);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panicking subscriber never runs under this lock, so a poisoned
        // state is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ttl(&self, collection: Collection) -> Duration {
        Duration::from_millis(self.config.stale_time_for(collection))
    }

    fn entry_is_stale(&self, key: &QueryKey, entry: &Entry) -> bool {
        if entry.invalidated {
            return true;
        }
        match entry.fetched_at {
            Some(at) => at.elapsed() >= self.ttl(key.collection),
            None => true,
        }
    }

    // ==================== Reads ====================

    /// Current value without any refetch side effect
    pub fn peek(&self, key: &QueryKey) -> Option<CacheValue> {
        self.lock().entries.get(key).and_then(|e| e.value.clone())
    }

    /// Current value. A stale or missing value schedules a background
    /// refetch, but the stale value is still returned immediately.
    pub fn get(self: &Arc<Self>, key: &QueryKey) -> Option<CacheValue> {
        self.read(key).data
    }

    /// `{data, is_loading, error}` view for the presentation layer
    pub fn read(self: &Arc<Self>, key: &QueryKey) -> QueryResult {
        let (result, should_fetch) = {
            let mut state = self.lock();
            let stale = match state.entries.get(key) {
                Some(entry) => self.entry_is_stale(key, entry),
                None => true,
            };
            let entry = state.entry(key);
            let should_fetch = stale && !entry.fetching;
            if should_fetch {
                entry.fetching = true;
            }
            let result = QueryResult {
                data: entry.value.clone(),
                is_loading: entry.fetching,
                is_stale: stale,
                error: entry.error.clone(),
            };
            (result, should_fetch)
        };

        if should_fetch && !self.spawn_refetch(key.clone()) {
            self.lock().entry(key).fetching = false;
            return QueryResult {
                is_loading: false,
                ..result
            };
        }
        result
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        let state = self.lock();
        match state.entries.get(key) {
            Some(entry) => self.entry_is_stale(key, entry),
            None => true,
        }
    }

    pub fn find_entity(&self, key: &QueryKey, id: &EntityId) -> Option<Entity> {
        let state = self.lock();
        state
            .entries
            .get(key)
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.find_entity(id))
            .cloned()
    }

    // ==================== Writes ====================

    /// Replace the value under `key` and notify subscribers in registration order
    pub fn set(&self, key: &QueryKey, value: CacheValue) {
        let notification = {
            let mut state = self.lock();
            state.write_remote(key, RemoteWrite::Replace(value));
            state.notification(key)
        };
        if let Some(n) = notification {
            n.deliver();
        }
    }

    /// Mark stale; the next read refetches
    pub fn invalidate(&self, key: &QueryKey) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.invalidated = true;
            debug!(key = %key, "Invalidated");
        }
    }

    /// Append to the history log under `key`
    pub fn append_history(&self, key: &QueryKey, entry: HistoryEntry) {
        let notification = {
            let mut state = self.lock();
            let slot = state.entry(key);
            match slot.value.get_or_insert_with(|| CacheValue::History(Vec::new())) {
                CacheValue::History(entries) => entries.push(entry),
                _ => {
                    warn!(key = %key, "History append on a non-history key ignored");
                    return;
                }
            }
            state.notification(key)
        };
        if let Some(n) = notification {
            n.deliver();
        }
    }

    /// Drop every key, pin, queued change and subscriber
    pub fn clear(&self) {
        *self.lock() = CacheState::default();
    }

    // ==================== Subscriptions ====================

    pub fn subscribe(&self, key: &QueryKey, subscriber: Subscriber) -> SubscriptionId {
        let mut state = self.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        state.entry(key).subscribers.push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.lock();
        for entry in state.entries.values_mut() {
            entry.subscribers.retain(|(sid, _)| *sid != id);
        }
    }

    /// Keys with at least one subscriber
    pub fn subscribed_keys(&self) -> Vec<QueryKey> {
        let state = self.lock();
        let mut keys: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.subscribers.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    // ==================== Background refetch ====================

    fn spawn_refetch(self: &Arc<Self>, key: QueryKey) -> bool {
        let fetcher = match self.fetcher.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(fetcher) = fetcher else {
            return false;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %key, "No runtime, skipping background refetch");
            return false;
        };

        let cache = Arc::clone(self);
        runtime.spawn(async move {
            let result = fetcher.fetch(&key).await;
            cache.finish_fetch(&key, result);
        });
        true
    }

    /// Land a fetch result. Keys with in-flight mutations get the result
    /// queued until they settle.
    pub fn finish_fetch(&self, key: &QueryKey, result: Result<CacheValue>) {
        let notification = {
            let mut state = self.lock();
            state.entry(key).fetching = false;
            match result {
                Ok(value) => {
                    if state.has_pins(key) {
                        debug!(key = %key, "Refetch landed during a mutation, deferring");
                        state
                            .deferred
                            .entry(key.clone())
                            .or_default()
                            .push(RemoteWrite::Replace(value));
                        None
                    } else {
                        state.write_remote(key, RemoteWrite::Replace(value));
                        state.notification(key)
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Background refetch failed, keeping stale value");
                    state.entry(key).error = Some(e.to_string());
                    None
                }
            }
        };
        if let Some(n) = notification {
            n.deliver();
        }
    }

    // ==================== Remote changes ====================

    /// Apply a remote change now, or queue it if its slot is mid-mutation
    pub fn apply_remote(&self, key: &QueryKey, write: RemoteWrite) -> RemoteOutcome {
        let notification = {
            let mut state = self.lock();
            if state.blocks(key, &write) {
                state.deferred.entry(key.clone()).or_default().push(write);
                return RemoteOutcome::Deferred;
            }
            state.write_remote(key, write);
            state.notification(key)
        };
        if let Some(n) = notification {
            n.deliver();
        }
        RemoteOutcome::Applied
    }

    pub fn deferred_count(&self, key: &QueryKey) -> usize {
        self.lock().deferred.get(key).map_or(0, Vec::len)
    }

    // ==================== Optimistic bookkeeping ====================

    /// Write a prediction into the slot for `id` and pin it.
    ///
    /// Returns the rollback snapshot. Creates append to the list.
    pub(crate) fn apply_optimistic(
        &self,
        key: &QueryKey,
        id: &EntityId,
        change: OptimisticChange,
    ) -> SlotSnapshot {
        let (snapshot, notification) = {
            let mut state = self.lock();
            let slot = key.entity(id.clone());
            let absent = state.entries.get(key).map_or(true, |e| e.value.is_none());

            let items = match state.entities_mut(key) {
                Some(items) => items,
                None => {
                    return SlotSnapshot {
                        position: None,
                        prior: None,
                    }
                }
            };
            let position = items.iter().position(|e| e.id() == id);
            let snapshot = SlotSnapshot {
                position,
                prior: position.map(|i| items[i].clone()),
            };

            match (change, position) {
                (OptimisticChange::Insert(entity), _) => items.push(entity),
                (OptimisticChange::Replace(entity), Some(i)) => items[i] = entity,
                (OptimisticChange::Replace(entity), None) => items.push(entity),
                (OptimisticChange::Remove, Some(i)) => {
                    items.remove(i);
                }
                (OptimisticChange::Remove, None) => {}
            }
            if absent {
                state.entry(key).materialized = true;
            }

            state
                .pins
                .entry(slot)
                .and_modify(|pin| pin.count += 1)
                .or_insert_with(|| Pin {
                    count: 1,
                    snapshot: snapshot.clone(),
                });
            (snapshot, state.notification(key))
        };
        if let Some(n) = notification {
            n.deliver();
        }
        snapshot
    }

    /// Settle a pinned slot with the server's entity.
    ///
    /// `server` replaces the prediction in place. When the server id differs
    /// from `id` the optimistic id is retired into the alias table; the swap
    /// happens under one lock so subscribers only ever see one of the two.
    /// `None` confirms a delete.
    pub(crate) fn confirm(&self, key: &QueryKey, id: &EntityId, server: Option<Entity>) {
        let notification = {
            let mut state = self.lock();
            let slot = key.entity(id.clone());

            let mut retired_to = None;
            if let Some(items) = state.entities_mut(key) {
                match server {
                    Some(entity) => {
                        let server_id = entity.id().clone();
                        // a push may have delivered the server row already
                        if &server_id != id {
                            items.retain(|e| e.id() != &server_id);
                            retired_to = Some(server_id);
                        }
                        match items.iter().position(|e| e.id() == id) {
                            Some(i) => items[i] = entity,
                            None => items.push(entity),
                        }
                    }
                    None => items.retain(|e| e.id() != id),
                }
            }
            if let Some(server_id) = retired_to {
                state.retire(slot.clone(), server_id, self.config.max_aliases);
            }

            state.unpin(&slot);
            state.drain_deferred(key);
            state.notification(key)
        };
        if let Some(n) = notification {
            n.deliver();
        }
    }

    /// Restore a pinned slot to its snapshot, discarding the prediction
    pub(crate) fn rollback(&self, key: &QueryKey, id: &EntityId) {
        let notification = {
            let mut state = self.lock();
            let slot = key.entity(id.clone());
            let Some(snapshot) = state.unpin(&slot) else {
                warn!(slot = %slot, "Rollback for a slot that is not pinned");
                return;
            };

            if let Some(items) = state.entities_mut(key) {
                items.retain(|e| e.id() != id);
                if let Some(prior) = snapshot.prior {
                    let at = snapshot.position.unwrap_or(items.len()).min(items.len());
                    items.insert(at, prior);
                }
            }
            state.drain_deferred(key);
            if !state.has_pins(key) {
                // nothing was loaded before the prediction, so go back to absent
                let entry = state.entry(key);
                if entry.materialized && entry.value.as_ref().is_some_and(CacheValue::is_empty) {
                    entry.value = None;
                    entry.materialized = false;
                }
            }
            state.notification(key)
        };
        if let Some(n) = notification {
            n.deliver();
        }
    }

    pub fn is_pinned(&self, slot: &EntityRef) -> bool {
        self.lock().pins.contains_key(slot)
    }

    /// Number of in-flight slots under `key`
    pub fn pinned_count(&self, key: &QueryKey) -> usize {
        self.lock().pins.keys().filter(|p| &p.key == key).count()
    }

    pub fn alias_count(&self) -> usize {
        self.lock().aliases.len()
    }

    /// Server id that replaced a retired optimistic id
    pub fn resolve_alias(&self, slot: &EntityRef) -> Option<EntityId> {
        self.lock().aliases.get(slot).cloned()
    }

    /// The value with every in-flight prediction swapped back for its
    /// snapshot: the part of the key that is safe to persist.
    pub fn confirmed_view(&self, key: &QueryKey) -> Option<CacheValue> {
        let state = self.lock();
        let mut value = state.entries.get(key)?.value.clone()?;

        if let Some(items) = value.entities_mut() {
            let mut pinned: Vec<(&EntityRef, &Pin)> =
                state.pins.iter().filter(|(p, _)| &p.key == key).collect();
            pinned.sort_by_key(|(_, pin)| pin.snapshot.position);

            for (slot, pin) in pinned {
                items.retain(|e| e.id() != &slot.id);
                if let Some(prior) = &pin.snapshot.prior {
                    let at = pin
                        .snapshot
                        .position
                        .unwrap_or(items.len())
                        .min(items.len());
                    items.insert(at, prior.clone());
                }
            }
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reward, Scope, Task};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> QueryKey {
        QueryKey::new(Collection::Tasks, Scope::new("u1"))
    }

    fn task(id: &str, title: &str) -> Entity {
        Entity::Task(Task {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        })
    }

    fn cache() -> Arc<QueryCache> {
        Arc::new(QueryCache::new(CacheConfig::default()))
    }

    #[test]
    fn test_subscribers_notified_in_registration_order() {
        let cache = cache();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = order.clone();
            cache.subscribe(
                &key(),
                Arc::new(move |value: &CacheValue| {
                    order.lock().unwrap().push((n, value.len()));
                }),
            );
        }

        cache.set(&key(), CacheValue::Entities(vec![task("t1", "a")]));
        assert_eq!(*order.lock().unwrap(), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = cache.subscribe(
            &key(),
            Arc::new(move |_: &CacheValue| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        cache.set(&key(), CacheValue::Entities(vec![]));
        cache.unsubscribe(id);
        cache.set(&key(), CacheValue::Entities(vec![]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.subscribed_keys().is_empty());
    }

    #[test]
    fn test_scopes_are_isolated() {
        let cache = cache();
        let alice = QueryKey::new(Collection::Tasks, Scope::new("alice"));
        let bob = QueryKey::new(Collection::Tasks, Scope::new("bob"));
        cache.set(&alice, CacheValue::Entities(vec![task("t1", "a")]));
        assert!(cache.peek(&bob).is_none());
    }

    #[test]
    fn test_fresh_value_is_not_stale_until_invalidated() {
        let cache = cache();
        cache.set(&key(), CacheValue::Entities(vec![]));
        assert!(!cache.is_stale(&key()));

        cache.invalidate(&key());
        assert!(cache.is_stale(&key()));
    }

    #[test]
    fn test_rollback_restores_exact_snapshot() {
        let cache = cache();
        let before = CacheValue::Entities(vec![task("t1", "a"), task("t2", "b"), task("t3", "c")]);
        cache.set(&key(), before.clone());

        cache.apply_optimistic(&key(), &"t2".into(), OptimisticChange::Remove);
        assert_eq!(cache.peek(&key()).unwrap().len(), 2);

        cache.rollback(&key(), &"t2".into());
        assert_eq!(cache.peek(&key()).unwrap(), before);
        assert!(!cache.is_pinned(&key().entity("t2".into())));
    }

    #[test]
    fn test_rollback_on_unloaded_key_restores_absence() {
        let cache = cache();
        let opt = EntityId::optimistic();
        cache.apply_optimistic(&key(), &opt, OptimisticChange::Insert(task(opt.as_str(), "new")));
        assert_eq!(cache.peek(&key()).unwrap().len(), 1);
        assert!(cache.confirmed_view(&key()).unwrap().is_empty());

        cache.rollback(&key(), &opt);
        assert!(cache.peek(&key()).is_none());
        assert!(cache.confirmed_view(&key()).is_none());
        assert!(cache.is_stale(&key()));
    }

    #[test]
    fn test_rollback_keeps_value_loaded_during_mutation() {
        let cache = cache();
        let first = EntityId::optimistic();
        let second = EntityId::optimistic();
        cache.apply_optimistic(&key(), &first, OptimisticChange::Insert(task(first.as_str(), "a")));
        cache.apply_optimistic(&key(), &second, OptimisticChange::Insert(task(second.as_str(), "b")));

        // one pin is still held, so the emptied list stays
        cache.rollback(&key(), &first);
        assert_eq!(cache.peek(&key()).unwrap().len(), 1);

        // a load while pinned makes the key real
        cache.set(&key(), CacheValue::Entities(vec![]));
        cache.rollback(&key(), &second);
        assert_eq!(cache.peek(&key()), Some(CacheValue::Entities(vec![])));
    }

    #[test]
    fn test_confirm_rekeys_optimistic_entity() {
        let cache = cache();
        cache.set(&key(), CacheValue::Entities(vec![task("t1", "a")]));

        let opt = EntityId::optimistic();
        cache.apply_optimistic(&key(), &opt, OptimisticChange::Insert(task(opt.as_str(), "new")));
        cache.confirm(&key(), &opt, Some(task("srv-9", "new")));

        let value = cache.peek(&key()).unwrap();
        assert!(value.find_entity(&opt).is_none());
        assert_eq!(
            value
                .entities()
                .unwrap()
                .iter()
                .filter(|e| e.id().as_str() == "srv-9")
                .count(),
            1
        );
        assert_eq!(
            cache.resolve_alias(&key().entity(opt)),
            Some(EntityId::new("srv-9"))
        );
    }

    #[test]
    fn test_alias_table_drops_oldest_past_limit() {
        let cache = Arc::new(QueryCache::new(CacheConfig {
            max_aliases: 2,
            ..Default::default()
        }));
        cache.set(&key(), CacheValue::Entities(vec![]));

        let mut retired = Vec::new();
        for n in 0..3 {
            let opt = EntityId::optimistic();
            cache.apply_optimistic(&key(), &opt, OptimisticChange::Insert(task(opt.as_str(), "new")));
            cache.confirm(&key(), &opt, Some(task(&format!("srv-{n}"), "new")));
            retired.push(opt);
        }

        assert_eq!(cache.alias_count(), 2);
        assert!(cache.resolve_alias(&key().entity(retired[0].clone())).is_none());
        assert_eq!(
            cache.resolve_alias(&key().entity(retired[2].clone())),
            Some(EntityId::new("srv-2"))
        );
        assert_eq!(cache.peek(&key()).unwrap().len(), 3);
    }

    #[test]
    fn test_remote_write_deferred_while_pinned() {
        let cache = cache();
        cache.set(&key(), CacheValue::Entities(vec![task("t1", "a")]));
        cache.apply_optimistic(
            &key(),
            &"t1".into(),
            OptimisticChange::Replace(task("t1", "local")),
        );

        let outcome = cache.apply_remote(&key(), RemoteWrite::Upsert(task("t1", "partner")));
        assert_eq!(outcome, RemoteOutcome::Deferred);
        assert_eq!(cache.find_entity(&key(), &"t1".into()).unwrap().title(), "local");

        cache.rollback(&key(), &"t1".into());
        assert_eq!(cache.find_entity(&key(), &"t1".into()).unwrap().title(), "partner");
        assert_eq!(cache.deferred_count(&key()), 0);
    }

    #[test]
    fn test_remote_write_to_other_entity_applies_immediately() {
        let cache = cache();
        cache.set(&key(), CacheValue::Entities(vec![task("t1", "a")]));
        cache.apply_optimistic(&key(), &"t1".into(), OptimisticChange::Remove);

        let outcome = cache.apply_remote(&key(), RemoteWrite::Upsert(task("t2", "b")));
        assert_eq!(outcome, RemoteOutcome::Applied);
        assert!(cache.find_entity(&key(), &"t2".into()).is_some());
    }

    #[test]
    fn test_confirmed_view_hides_predictions() {
        let cache = cache();
        let rewards = QueryKey::new(Collection::Rewards, Scope::new("u1"));
        let reward = Entity::Reward(Reward {
            id: "r1".into(),
            supply: 2,
            ..Default::default()
        });
        cache.set(&rewards, CacheValue::Entities(vec![reward.clone()]));

        let mut predicted = reward.clone();
        if let Entity::Reward(r) = &mut predicted {
            r.supply = 1;
        }
        cache.apply_optimistic(&rewards, &"r1".into(), OptimisticChange::Replace(predicted));
        let opt = EntityId::optimistic();
        cache.apply_optimistic(
            &rewards,
            &opt,
            OptimisticChange::Insert(Entity::Reward(Reward {
                id: opt.clone(),
                ..Default::default()
            })),
        );

        let view = cache.confirmed_view(&rewards).unwrap();
        assert_eq!(view, CacheValue::Entities(vec![reward]));
    }

    #[test]
    fn test_finish_fetch_records_error_and_keeps_value() {
        let cache = cache();
        cache.set(&key(), CacheValue::Entities(vec![task("t1", "a")]));
        cache.finish_fetch(&key(), Err(crate::error::SyncError::Network("down".into())));

        let result = cache.read(&key());
        assert_eq!(result.data.unwrap().len(), 1);
        assert_eq!(result.error.as_deref(), Some("Network error: down"));
    }
}
