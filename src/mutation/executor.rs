//! Optimistic mutation executor
//!
//! Every mutation follows the same path:
//!
//! 1. run any due periodic reset, then hold the read half of the reset gate
//! 2. take the per-entity lock (following the alias table if the id was retired)
//! 3. plan: validate against the cached entity and build the prediction
//! 4. write the prediction into the cache and pin the slot
//! 5. call the backend, bounded by the mutation timeout
//! 6. on success apply the ledger delta, confirm the slot and persist;
//!    on any failure restore the slot's snapshot
//!
//! The ledger is only ever written from step 6, so a rolled-back mutation can
//! never leave a points change behind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Datelike, Weekday};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::intent::{EntityDraft, EntityPatch};
use super::locks::EntityLocks;
use super::phase::{MutationPhase, PhaseTracker};
use crate::cache::{CacheValue, EntityRef, OptimisticChange, QueryCache, QueryKey};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::model::{
    Collection, Entity, EntityId, HistoryEntry, HistoryKind, LedgerDelta, PointsLedger, Scope,
};
use crate::remote::RemoteBackend;
use crate::reset::ResetScheduler;
use crate::store::CollectionWriter;

/// Result of a confirmed mutation
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub phase: MutationPhase,
    /// Server row, `None` for deletes
    pub entity: Option<Entity>,
    /// New balance when the mutation touched the ledger
    pub ledger: Option<PointsLedger>,
}

enum Write {
    Insert(Entity),
    Update(Entity),
    Delete,
}

struct LedgerEffect {
    delta: LedgerDelta,
    kind: HistoryKind,
}

struct Plan<'a> {
    write: Write,
    ledger: Option<LedgerEffect>,
    _reservation: Option<Reservation<'a>>,
}

impl Plan<'_> {
    fn update(entity: Entity) -> Self {
        Self {
            write: Write::Update(entity),
            ledger: None,
            _reservation: None,
        }
    }
}

/// Debit held against a scope's spendable balance until the mutation settles
struct Reservation<'a> {
    table: &'a Mutex<HashMap<Scope, i64>>,
    scope: Scope,
    amount: i64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut reserved = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(held) = reserved.get_mut(&self.scope) {
            *held -= self.amount;
            if *held <= 0 {
                reserved.remove(&self.scope);
            }
        }
    }
}

pub struct MutationExecutor {
    cache: Arc<QueryCache>,
    writer: Arc<CollectionWriter>,
    backend: Arc<dyn RemoteBackend>,
    resets: Arc<ResetScheduler>,
    clock: Arc<dyn Clock>,
    gate: Arc<RwLock<()>>,
    locks: EntityLocks,
    reserved: Mutex<HashMap<Scope, i64>>,
    timeout: Duration,
}

impl MutationExecutor {
    pub fn new(
        cache: Arc<QueryCache>,
        writer: Arc<CollectionWriter>,
        backend: Arc<dyn RemoteBackend>,
        resets: Arc<ResetScheduler>,
        timeout: Duration,
    ) -> Self {
        Self {
            clock: resets.clock(),
            gate: resets.gate(),
            cache,
            writer,
            backend,
            resets,
            locks: EntityLocks::new(),
            reserved: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    // ==================== Generic intents ====================

    /// Create an entity. It is visible under an `opt-` id until the server
    /// confirms, then re-keyed to the server id.
    pub async fn create(&self, scope: &Scope, draft: EntityDraft) -> Result<MutationOutcome> {
        self.resets.run_due(scope).await;
        let _gate = self.gate.read().await;

        let key = QueryKey::new(draft.collection(), scope.clone());
        let prediction = draft.into_prediction(scope, self.clock.now());
        let slot = key.entity(prediction.id().clone());
        let outcome = {
            let _entity = self.locks.acquire(&slot).await;
            let tracker = PhaseTracker::new(slot, "create");
            let plan = Plan {
                write: Write::Insert(prediction),
                ledger: None,
                _reservation: None,
            };
            self.dispatch(&key, tracker, plan).await
        };
        self.locks.prune();
        outcome
    }

    pub async fn update(
        &self,
        scope: &Scope,
        collection: Collection,
        id: &EntityId,
        patch: EntityPatch,
    ) -> Result<MutationOutcome> {
        let now = self.clock.now();
        self.mutate(collection, scope, id, "update", move |prior, _| {
            if patch.is_empty() {
                return Err(SyncError::InvalidMutation("empty patch".into()));
            }
            Ok(Plan::update(patch.merged_into(prior, now)?))
        })
        .await
    }

    pub async fn delete(
        &self,
        scope: &Scope,
        collection: Collection,
        id: &EntityId,
    ) -> Result<MutationOutcome> {
        self.mutate(collection, scope, id, "delete", |_, _| {
            Ok(Plan {
                write: Write::Delete,
                ledger: None,
                _reservation: None,
            })
        })
        .await
    }

    // ==================== Domain intents ====================

    /// Complete a task: sets `completed` and today's slot. The ledger gains the
    /// task's points once the server confirms.
    pub async fn complete_task(&self, scope: &Scope, id: &EntityId) -> Result<MutationOutcome> {
        self.mutate(Collection::Tasks, scope, id, "complete_task", |prior, today| {
            let Entity::Task(task) = prior else {
                return Err(not_a(prior, "task"));
            };
            if task.completed {
                return Err(SyncError::InvalidMutation(format!(
                    "task {} already completed",
                    task.id
                )));
            }
            let mut next = task.clone();
            next.completed = true;
            next.usage_counters = next.usage_counters.marked(today);
            Ok(Plan {
                write: Write::Update(Entity::Task(next)),
                ledger: Some(LedgerEffect {
                    delta: LedgerDelta::points(task.points),
                    kind: HistoryKind::TaskCompleted,
                }),
                _reservation: None,
            })
        })
        .await
    }

    pub async fn record_rule_violation(&self, scope: &Scope, id: &EntityId) -> Result<MutationOutcome> {
        self.mutate(Collection::Rules, scope, id, "record_rule_violation", |prior, today| {
            let Entity::Rule(rule) = prior else {
                return Err(not_a(prior, "rule"));
            };
            let mut next = rule.clone();
            next.usage_counters = next.usage_counters.marked(today);
            Ok(Plan::update(Entity::Rule(next)))
        })
        .await
    }

    /// Redeem a reward: consumes one unit of supply and, on confirm, deducts
    /// the cost. Rejected before dispatch if supply or balance fall short.
    pub async fn redeem_reward(&self, scope: &Scope, id: &EntityId) -> Result<MutationOutcome> {
        self.ensure_ledger(scope).await?;
        self.mutate(Collection::Rewards, scope, id, "redeem_reward", |prior, today| {
            let Entity::Reward(reward) = prior else {
                return Err(not_a(prior, "reward"));
            };
            if reward.supply < 1 {
                return Err(SyncError::InsufficientSupply {
                    entity_id: reward.id.to_string(),
                    available: reward.supply,
                });
            }
            let reservation = self.reserve(scope, reward.cost, true)?;

            let mut next = reward.clone();
            next.supply -= 1;
            next.usage_counters = next.usage_counters.marked(today);
            Ok(Plan {
                write: Write::Update(Entity::Reward(next)),
                ledger: Some(LedgerEffect {
                    delta: LedgerDelta::points(-reward.cost),
                    kind: HistoryKind::RewardRedeemed,
                }),
                _reservation: Some(reservation),
            })
        })
        .await
    }

    /// Add `amount` units of supply. No ledger effect.
    pub async fn restock_reward(
        &self,
        scope: &Scope,
        id: &EntityId,
        amount: u32,
    ) -> Result<MutationOutcome> {
        self.mutate(Collection::Rewards, scope, id, "restock_reward", |prior, _| {
            let Entity::Reward(reward) = prior else {
                return Err(not_a(prior, "reward"));
            };
            if amount == 0 {
                return Err(SyncError::InvalidMutation("restock amount must be positive".into()));
            }
            let mut next = reward.clone();
            next.supply = next.supply.saturating_add(amount);
            Ok(Plan::update(Entity::Reward(next)))
        })
        .await
    }

    /// Apply a punishment: marks today's slot and, on confirm, deducts its
    /// points. The balance may go negative.
    pub async fn apply_punishment(&self, scope: &Scope, id: &EntityId) -> Result<MutationOutcome> {
        self.ensure_ledger(scope).await?;
        self.mutate(Collection::Punishments, scope, id, "apply_punishment", |prior, today| {
            let Entity::Punishment(punishment) = prior else {
                return Err(not_a(prior, "punishment"));
            };
            let reservation = self.reserve(scope, punishment.points, false)?;
            let mut next = punishment.clone();
            next.usage_counters = next.usage_counters.marked(today);
            Ok(Plan {
                write: Write::Update(Entity::Punishment(next)),
                ledger: Some(LedgerEffect {
                    delta: LedgerDelta::points(-punishment.points),
                    kind: HistoryKind::PunishmentApplied,
                }),
                _reservation: Some(reservation),
            })
        })
        .await
    }

    /// Points available to spend: cached balance minus in-flight debits
    pub fn spendable(&self, scope: &Scope) -> i64 {
        let balance = self.cached_balance(scope);
        let reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(scope)
            .copied()
            .unwrap_or(0);
        balance - reserved
    }

    // ==================== Internals ====================

    /// Shared path for mutations of an existing entity
    async fn mutate<'a, F>(
        &'a self,
        collection: Collection,
        scope: &Scope,
        id: &EntityId,
        intent: &'static str,
        plan: F,
    ) -> Result<MutationOutcome>
    where
        F: FnOnce(&Entity, Weekday) -> Result<Plan<'a>>,
    {
        self.resets.run_due(scope).await;
        let _gate = self.gate.read().await;

        let key = QueryKey::new(collection, scope.clone());
        let outcome = {
            let (slot, _entity) = self.lock_slot(&key, id).await;
            let mut tracker = PhaseTracker::new(slot.clone(), intent);

            let planned = self
                .cache
                .find_entity(&key, &slot.id)
                .ok_or_else(|| SyncError::NotFound(slot.to_string()))
                .and_then(|prior| plan(&prior, self.clock.today().weekday()));

            match planned {
                Ok(plan) => self.dispatch(&key, tracker, plan).await,
                Err(e) => {
                    tracker.advance(MutationPhase::Rejected);
                    info!(slot = %slot, intent, error = %e, "Mutation rejected");
                    Err(e)
                }
            }
        };
        self.locks.prune();
        outcome
    }

    /// Lock the slot for `id`, following the alias table when a create that
    /// minted `id` has since been confirmed under a server id.
    async fn lock_slot(&self, key: &QueryKey, id: &EntityId) -> (EntityRef, OwnedMutexGuard<()>) {
        let requested = key.entity(id.clone());
        let mut slot = match self.cache.resolve_alias(&requested) {
            Some(server_id) => key.entity(server_id),
            None => requested,
        };
        loop {
            let guard = self.locks.acquire(&slot).await;
            // a create may have been confirmed while we waited
            match self.cache.resolve_alias(&slot) {
                Some(server_id) => {
                    debug!(from = %slot, to = %server_id, "Following retired optimistic id");
                    drop(guard);
                    slot = key.entity(server_id);
                }
                None => return (slot, guard),
            }
        }
    }

    async fn dispatch(
        &self,
        key: &QueryKey,
        mut tracker: PhaseTracker,
        plan: Plan<'_>,
    ) -> Result<MutationOutcome> {
        let id = tracker.slot().id.clone();

        let change = match &plan.write {
            Write::Insert(e) => OptimisticChange::Insert(e.clone()),
            Write::Update(e) => OptimisticChange::Replace(e.clone()),
            Write::Delete => OptimisticChange::Remove,
        };
        self.cache.apply_optimistic(key, &id, change);
        tracker.advance(MutationPhase::AppliedLocally);

        tracker.advance(MutationPhase::InFlight);
        let result = match &plan.write {
            Write::Insert(e) => self.remote(self.backend.insert(e)).await.map(Some),
            Write::Update(e) => self.remote(self.backend.update(e)).await.map(Some),
            Write::Delete => self
                .remote(self.backend.delete(key.collection, &key.scope, &id))
                .await
                .map(|_| None),
        };

        let server = match result {
            Ok(server) => server,
            Err(e) => {
                self.cache.rollback(key, &id);
                tracker.advance(MutationPhase::RolledBack);
                warn!(key = %key, %id, error = %e, "Mutation failed, rolled back");
                return Err(e);
            }
        };

        let points_key = QueryKey::new(Collection::Points, key.scope.clone());
        let mut ledger = None;
        if let Some(effect) = &plan.ledger {
            match self
                .remote(self.backend.apply_ledger_delta(&key.scope, effect.delta))
                .await
            {
                Ok(balance) => {
                    self.cache.set(&points_key, CacheValue::Ledger(balance.clone()));
                    ledger = Some(balance);
                }
                Err(e) => {
                    // the row write landed but the ledger did not: resync both
                    self.cache.rollback(key, &id);
                    self.cache.invalidate(key);
                    self.cache.invalidate(&points_key);
                    tracker.advance(MutationPhase::RolledBack);
                    warn!(key = %key, %id, error = %e, "Ledger update failed, rolled back");
                    return Err(e);
                }
            }
        }

        self.cache.confirm(key, &id, server.clone());
        tracker.advance(MutationPhase::Confirmed);
        debug!(key = %key, %id, server_id = ?server.as_ref().map(|e| e.id().to_string()), "Mutation confirmed");

        if let (Some(effect), Some(entity)) = (&plan.ledger, &server) {
            self.record_history(&key.scope, effect, entity).await;
        }

        self.persist(key).await;
        if plan.ledger.is_some() {
            self.persist(&points_key).await;
            self.persist(&QueryKey::new(Collection::History, key.scope.clone()))
                .await;
        }

        Ok(MutationOutcome {
            phase: tracker.phase(),
            entity: server,
            ledger,
        })
    }

    async fn remote<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| SyncError::Timeout(self.timeout.as_millis() as u64))?
    }

    /// Append to the history log. The remote insert is best effort; a local
    /// entry is kept either way.
    async fn record_history(&self, scope: &Scope, effect: &LedgerEffect, entity: &Entity) {
        let key = QueryKey::new(Collection::History, scope.clone());
        let entry = HistoryEntry {
            id: EntityId::optimistic(),
            owner_scope: scope.clone(),
            kind: effect.kind,
            entity_id: entity.id().clone(),
            title: entity.title().to_string(),
            points_delta: effect.delta.points,
            occurred_at: self.clock.now(),
        };

        match self.remote(self.backend.insert_history(&entry)).await {
            Ok(stored) => self.cache.append_history(&key, stored),
            Err(e) => {
                warn!(%scope, error = %e, "History insert failed, keeping local entry");
                self.cache.append_history(&key, entry);
                self.cache.invalidate(&key);
            }
        }
    }

    /// Persist the confirmed part of a key
    async fn persist(&self, key: &QueryKey) {
        self.writer.persist(key).await;
    }

    fn cached_balance(&self, scope: &Scope) -> i64 {
        let key = QueryKey::new(Collection::Points, scope.clone());
        self.cache
            .peek(&key)
            .and_then(|v| v.ledger().map(|l| l.points))
            .unwrap_or(0)
    }

    /// Load the ledger into the cache if this session has not seen it yet
    async fn ensure_ledger(&self, scope: &Scope) -> Result<()> {
        let key = QueryKey::new(Collection::Points, scope.clone());
        if self.cache.peek(&key).is_some() {
            return Ok(());
        }
        let ledger = self.remote(self.backend.fetch_ledger(scope)).await?;
        self.cache.set(&key, CacheValue::Ledger(ledger));
        Ok(())
    }

    /// Hold `amount` against the spendable balance. With `enforce`, fail if the
    /// balance cannot cover it.
    fn reserve(&self, scope: &Scope, amount: i64, enforce: bool) -> Result<Reservation<'_>> {
        let balance = self.cached_balance(scope);
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let held = reserved.get(scope).copied().unwrap_or(0);
        let available = balance - held;
        if enforce && amount > available {
            return Err(SyncError::InsufficientBalance {
                required: amount,
                available,
            });
        }
        *reserved.entry(scope.clone()).or_insert(0) += amount;
        Ok(Reservation {
            table: &self.reserved,
            scope: scope.clone(),
            amount,
        })
    }
}

fn not_a(entity: &Entity, expected: &str) -> SyncError {
    SyncError::InvalidMutation(format!(
        "{} is a {}, not a {}",
        entity.id(),
        entity.collection(),
        expected
    ))
}
