//! Reset scheduler
//!
//! Compares the current period of each kind against the durable marker and,
//! when they differ, clears usage counters for every entity of the matching
//! frequency. Runs behind the write half of the reset gate so no mutation is
//! in flight while counters are rewritten.
//!
//! Each collection records two progress markers per period: `cleared` once the
//! local copy was reset and `pushed` once the backend took the batch. A run
//! that finds `cleared` current only re-pushes, so a failing backend never
//! causes a second clear within the same period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::period::PeriodKind;
use crate::cache::{CacheValue, QueryCache, QueryKey};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::model::{Collection, Entity, Scope, UsageCounters};
use crate::remote::RemoteBackend;
use crate::store::{self, CollectionWriter, LocalStore};

/// Outcome of one period reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub kind: PeriodKind,
    pub period: String,
    /// Entities whose local counters changed
    pub entities_reset: usize,
    /// Whether the backend accepted the batch; the marker only advances if so
    pub remote_confirmed: bool,
}

pub struct ResetScheduler {
    cache: Arc<QueryCache>,
    store: Arc<dyn LocalStore>,
    writer: Arc<CollectionWriter>,
    backend: Arc<dyn RemoteBackend>,
    clock: Arc<dyn Clock>,
    gate: Arc<RwLock<()>>,
    timeout: Duration,
}

impl ResetScheduler {
    pub fn new(
        cache: Arc<QueryCache>,
        writer: Arc<CollectionWriter>,
        backend: Arc<dyn RemoteBackend>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store: writer.store(),
            writer,
            backend,
            clock,
            gate: Arc::new(RwLock::new(())),
            timeout,
        }
    }

    /// Gate shared with the mutation executor. Mutations hold the read half.
    pub fn gate(&self) -> Arc<RwLock<()>> {
        self.gate.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Period kinds whose marker is behind the current period
    pub fn due(&self, scope: &Scope) -> Vec<PeriodKind> {
        let today = self.clock.today();
        PeriodKind::ALL
            .into_iter()
            .filter(|kind| {
                let marker = store::marker_name(kind.marker_base(), scope);
                match self.store.load_marker(&marker) {
                    Ok(Some(last)) => last != kind.period_id(today),
                    Ok(None) => true,
                    Err(e) => {
                        warn!(%marker, error = %e, "Failed to read reset marker, treating as due");
                        true
                    }
                }
            })
            .collect()
    }

    /// Run every due reset for `scope`. A no-op when all markers are current.
    pub async fn run_due(&self, scope: &Scope) -> Vec<ResetReport> {
        if self.due(scope).is_empty() {
            return Vec::new();
        }

        let _exclusive = self.gate.write().await;
        // re-check: another caller may have reset while we waited
        let due = self.due(scope);
        let today = self.clock.today();

        let mut reports = Vec::with_capacity(due.len());
        for kind in due {
            let report = self.reset_period(scope, kind, kind.period_id(today)).await;
            reports.push(report);
        }
        reports
    }

    async fn reset_period(&self, scope: &Scope, kind: PeriodKind, period: String) -> ResetReport {
        info!(%scope, %kind, %period, "Running periodic reset");
        let frequency = kind.frequency();
        let now = self.clock.now();
        let mut entities_reset = 0;
        let mut remote_confirmed = true;

        for collection in Collection::ENTITIES {
            let cleared_marker = progress_marker(kind, scope, collection, "cleared");
            let pushed_marker = progress_marker(kind, scope, collection, "pushed");
            if self.marker_is(&pushed_marker, &period) {
                continue;
            }

            let key = QueryKey::new(collection, scope.clone());
            let items = match self.current_entities(&key).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(key = %key, error = %e, "No copy of collection to reset, will retry");
                    remote_confirmed = false;
                    continue;
                }
            };

            // a retry only re-pushes; rows touched since the clear keep their marks
            let batch: Vec<Entity> = if self.marker_is(&cleared_marker, &period) {
                debug!(key = %key, "Already cleared this period, re-pushing");
                items
                    .into_iter()
                    .filter(|entity| entity.frequency() == frequency)
                    .collect()
            } else {
                let mut changed = 0;
                let mut batch = Vec::new();
                let updated: Vec<Entity> = items
                    .into_iter()
                    .map(|entity| {
                        if entity.frequency() != frequency {
                            return entity;
                        }
                        let cleared = cleared(&entity, now);
                        if cleared != entity {
                            changed += 1;
                        }
                        batch.push(cleared.clone());
                        cleared
                    })
                    .collect();

                if changed > 0 {
                    self.cache.set(&key, CacheValue::Entities(updated));
                    self.writer.persist(&key).await;
                    entities_reset += changed;
                }
                self.save_marker(&cleared_marker, &period);
                batch
            };

            if !batch.is_empty() {
                let result = tokio::time::timeout(self.timeout, self.backend.batch_update(&batch))
                    .await
                    .map_err(|_| SyncError::Timeout(self.timeout.as_millis() as u64))
                    .and_then(|r| r);
                if let Err(e) = result {
                    warn!(key = %key, error = %e, "Remote reset batch failed, marker not advanced");
                    remote_confirmed = false;
                    continue;
                }
            }
            self.save_marker(&pushed_marker, &period);
        }

        if remote_confirmed {
            let marker = store::marker_name(kind.marker_base(), scope);
            self.save_marker(&marker, &period);
        }

        debug!(%scope, %kind, entities_reset, remote_confirmed, "Reset finished");
        ResetReport {
            kind,
            period,
            entities_reset,
            remote_confirmed,
        }
    }

    fn marker_is(&self, name: &str, period: &str) -> bool {
        match self.store.load_marker(name) {
            Ok(value) => value.as_deref() == Some(period),
            Err(e) => {
                warn!(marker = %name, error = %e, "Failed to read reset marker");
                false
            }
        }
    }

    fn save_marker(&self, name: &str, period: &str) {
        if let Err(e) = self.store.save_marker(name, period) {
            warn!(marker = %name, error = %e, "Failed to save reset marker");
        }
    }

    /// Best local copy of a collection: cache, then store, then backend
    async fn current_entities(&self, key: &QueryKey) -> Result<Vec<Entity>> {
        if let Some(CacheValue::Entities(items)) = self.cache.peek(key) {
            return Ok(items);
        }
        if let Some(CacheValue::Entities(items)) = store::load_value(self.store.as_ref(), &key.store_key()) {
            return Ok(items);
        }
        let fetched = tokio::time::timeout(
            self.timeout,
            self.backend.fetch_collection(key.collection, &key.scope),
        )
        .await
        .map_err(|_| SyncError::Timeout(self.timeout.as_millis() as u64))??;
        Ok(fetched)
    }
}

/// Per-collection progress within a period, e.g. `lastDailyResetKey:u1:tasks:cleared`
fn progress_marker(kind: PeriodKind, scope: &Scope, collection: Collection, step: &str) -> String {
    format!(
        "{}:{}:{}",
        store::marker_name(kind.marker_base(), scope),
        collection,
        step
    )
}

/// Copy of `entity` with counters cleared; tasks also lose `completed`
fn cleared(entity: &Entity, now: chrono::DateTime<chrono::Utc>) -> Entity {
    if entity.usage_counters().is_clear() && !matches!(entity, Entity::Task(t) if t.completed) {
        return entity.clone();
    }
    let mut reset = entity.clone();
    reset.set_usage_counters(UsageCounters::cleared());
    if let Entity::Task(task) = &mut reset {
        task.completed = false;
    }
    reset.touch(now);
    reset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::CacheConfig;
    use crate::model::{Frequency, Rule, Task};
    use crate::remote::InMemoryBackend;
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, Weekday};

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    struct Fixture {
        cache: Arc<QueryCache>,
        store: Arc<MemoryStore>,
        backend: Arc<InMemoryBackend>,
        clock: Arc<FixedClock>,
        scheduler: ResetScheduler,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(QueryCache::new(CacheConfig::default()));
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(FixedClock::new(monday()));
        let scheduler = ResetScheduler::new(
            cache.clone(),
            Arc::new(CollectionWriter::new(cache.clone(), store.clone())),
            backend.clone(),
            clock.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            cache,
            store,
            backend,
            clock,
            scheduler,
        }
    }

    fn daily_task(id: &str) -> Entity {
        Entity::Task(Task {
            id: id.into(),
            owner_scope: "u1".into(),
            frequency: Frequency::Daily,
            completed: true,
            usage_counters: UsageCounters::cleared().marked(Weekday::Mon),
            ..Default::default()
        })
    }

    fn weekly_rule(id: &str) -> Entity {
        Entity::Rule(Rule {
            id: id.into(),
            owner_scope: "u1".into(),
            frequency: Frequency::Weekly,
            usage_counters: UsageCounters::cleared().marked(Weekday::Mon),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_daily_reset_clears_only_daily_entities() {
        let f = fixture();
        let scope = Scope::new("u1");
        let tasks = QueryKey::new(Collection::Tasks, scope.clone());
        let rules = QueryKey::new(Collection::Rules, scope.clone());
        f.cache.set(&tasks, CacheValue::Entities(vec![daily_task("t1")]));
        f.cache.set(&rules, CacheValue::Entities(vec![weekly_rule("r1")]));
        f.store
            .save_marker(&store::marker_name(PeriodKind::Weekly.marker_base(), &scope), "2026-W43")
            .unwrap();

        let reports = f.scheduler.run_due(&scope).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, PeriodKind::Daily);
        assert_eq!(reports[0].entities_reset, 1);
        assert!(reports[0].remote_confirmed);

        let Some(Entity::Task(task)) = f.cache.find_entity(&tasks, &"t1".into()) else {
            panic!("task missing");
        };
        assert!(task.usage_counters.is_clear());
        assert!(!task.completed);
        let rule = f.cache.find_entity(&rules, &"r1".into()).unwrap();
        assert!(rule.usage_counters().is_marked(Weekday::Mon));
    }

    #[tokio::test]
    async fn test_reset_is_idempotent_within_period() {
        let f = fixture();
        let scope = Scope::new("u1");
        let tasks = QueryKey::new(Collection::Tasks, scope.clone());
        f.cache.set(&tasks, CacheValue::Entities(vec![daily_task("t1")]));

        assert!(!f.scheduler.run_due(&scope).await.is_empty());
        let after_first = f.cache.peek(&tasks);

        assert!(f.scheduler.run_due(&scope).await.is_empty());
        assert_eq!(f.cache.peek(&tasks), after_first);
        assert!(f.scheduler.due(&scope).is_empty());
    }

    #[tokio::test]
    async fn test_failed_remote_batch_keeps_marker_behind() {
        let f = fixture();
        let scope = Scope::new("u1");
        let tasks = QueryKey::new(Collection::Tasks, scope.clone());
        f.cache.set(&tasks, CacheValue::Entities(vec![daily_task("t1")]));
        f.backend.set_offline(true);

        let reports = f.scheduler.run_due(&scope).await;
        assert!(reports.iter().all(|r| !r.remote_confirmed));
        // applied locally regardless
        let task = f.cache.find_entity(&tasks, &"t1".into()).unwrap();
        assert!(task.usage_counters().is_clear());
        assert_eq!(f.scheduler.due(&scope).len(), 2);

        f.backend.set_offline(false);
        let retry = f.scheduler.run_due(&scope).await;
        assert!(retry.iter().all(|r| r.remote_confirmed));
        assert!(f.scheduler.due(&scope).is_empty());
    }

    #[tokio::test]
    async fn test_retry_within_period_keeps_later_completion() {
        let f = fixture();
        let scope = Scope::new("u1");
        let tasks = QueryKey::new(Collection::Tasks, scope.clone());
        f.cache.set(&tasks, CacheValue::Entities(vec![daily_task("t1")]));
        f.backend.set_offline(true);

        let first = f.scheduler.run_due(&scope).await;
        assert_eq!(first[0].entities_reset, 1);
        assert!(!first[0].remote_confirmed);

        // completed again after the local clear, before the backend took it
        f.cache.set(&tasks, CacheValue::Entities(vec![daily_task("t1")]));

        let second = f.scheduler.run_due(&scope).await;
        assert_eq!(second[0].kind, PeriodKind::Daily);
        assert_eq!(second[0].entities_reset, 0);
        assert!(!second[0].remote_confirmed);
        let Some(Entity::Task(task)) = f.cache.find_entity(&tasks, &"t1".into()) else {
            panic!("task missing");
        };
        assert!(task.completed);
        assert!(task.usage_counters.is_marked(Weekday::Mon));

        f.backend.set_offline(false);
        let retry = f.scheduler.run_due(&scope).await;
        assert!(retry.iter().all(|r| r.remote_confirmed && r.entities_reset == 0));
        assert!(f.scheduler.due(&scope).is_empty());
        let Some(Entity::Task(server)) = f.backend.server_entity(Collection::Tasks, &scope, &"t1".into())
        else {
            panic!("task missing on server");
        };
        assert!(server.completed);
    }

    #[tokio::test]
    async fn test_next_day_triggers_another_reset() {
        let f = fixture();
        let scope = Scope::new("u1");
        f.scheduler.run_due(&scope).await;
        assert!(f.scheduler.due(&scope).is_empty());

        f.clock.set(monday().succ_opt().unwrap());
        assert_eq!(f.scheduler.due(&scope), vec![PeriodKind::Daily]);
    }
}
