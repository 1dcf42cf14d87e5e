//! Sync engine facade
//!
//! [`SyncEngine`] owns one [`SyncContext`] and wires the store, cache,
//! executor, reconciliation channel and reset scheduler around it. Each
//! engine is fully isolated; nothing lives in process-wide state.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::{QueryCache, QueryKey, QueryResult, RemoteOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::model::{Collection, Scope};
use crate::mutation::MutationExecutor;
use crate::reconcile::{ReconcileChannel, ResyncReport};
use crate::remote::{BackendFetcher, HttpBackend, InMemoryBackend, RemoteBackend};
use crate::reset::{ResetReport, ResetScheduler};
use crate::store::{self, CollectionWriter, LocalStore, SqliteStore};

/// Explicit handle to everything the engine shares
#[derive(Clone)]
pub struct SyncContext {
    pub cache: Arc<QueryCache>,
    pub store: Arc<dyn LocalStore>,
    pub backend: Arc<dyn RemoteBackend>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

impl SyncContext {
    pub fn new(config: Config, store: Arc<dyn LocalStore>, backend: Arc<dyn RemoteBackend>) -> Self {
        Self {
            cache: Arc::new(QueryCache::new(config.cache.clone())),
            store,
            backend,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// SQLite store under `store.data_dir`, HTTP backend if `remote.base_url`
    /// is set and an in-memory one otherwise
    pub fn open(config: Config) -> Result<Self> {
        let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open(&config.store.data_dir)?);
        let backend: Arc<dyn RemoteBackend> = match &config.remote.base_url {
            Some(url) => Arc::new(HttpBackend::new(url, &config.remote)?),
            None => {
                warn!("No remote configured, running local-only");
                Arc::new(InMemoryBackend::new())
            }
        };
        Ok(Self::new(config, store, backend))
    }
}

pub struct SyncEngine {
    context: SyncContext,
    executor: MutationExecutor,
    resets: Arc<ResetScheduler>,
    channel: ReconcileChannel,
    scope: RwLock<Option<Scope>>,
}

impl SyncEngine {
    pub fn new(context: SyncContext) -> Self {
        let timeout = Duration::from_millis(context.config.mutation.timeout_ms);
        context
            .cache
            .set_fetcher(Arc::new(BackendFetcher::new(context.backend.clone())));

        let writer = Arc::new(CollectionWriter::new(
            context.cache.clone(),
            context.store.clone(),
        ));
        let resets = Arc::new(ResetScheduler::new(
            context.cache.clone(),
            writer.clone(),
            context.backend.clone(),
            context.clock.clone(),
            timeout,
        ));
        let executor = MutationExecutor::new(
            context.cache.clone(),
            writer.clone(),
            context.backend.clone(),
            resets.clone(),
            timeout,
        );
        let channel = ReconcileChannel::new(
            context.cache.clone(),
            writer,
            context.backend.clone(),
            timeout,
        );

        Self {
            context,
            executor,
            resets,
            channel,
            scope: RwLock::new(None),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.context.cache
    }

    pub fn executor(&self) -> &MutationExecutor {
        &self.executor
    }

    pub fn channel(&self) -> &ReconcileChannel {
        &self.channel
    }

    pub fn resets(&self) -> &ResetScheduler {
        &self.resets
    }

    // ==================== Session ====================

    /// Signed-in scope
    pub fn scope(&self) -> Result<Scope> {
        self.scope
            .read()
            .map_err(|_| SyncError::Storage("scope lock poisoned".into()))?
            .clone()
            .ok_or(SyncError::NoScope)
    }

    pub fn key(&self, collection: Collection) -> Result<QueryKey> {
        Ok(QueryKey::new(collection, self.scope()?))
    }

    /// Adopt `scope`, hydrate the cache from the local store and run any due
    /// reset. Hydrated values are marked stale so the first read refetches.
    pub async fn sign_in(&self, scope: Scope) -> Result<Vec<ResetReport>> {
        {
            let mut current = self
                .scope
                .write()
                .map_err(|_| SyncError::Storage("scope lock poisoned".into()))?;
            *current = Some(scope.clone());
        }

        let mut hydrated = 0;
        for collection in Collection::ALL {
            let key = QueryKey::new(collection, scope.clone());
            if let Some(value) = store::load_value(self.context.store.as_ref(), &key.store_key()) {
                self.context.cache.set(&key, value);
                self.context.cache.invalidate(&key);
                hydrated += 1;
            }
        }
        info!(%scope, hydrated, "Signed in");

        Ok(self.resets.run_due(&scope).await)
    }

    /// Drop the scope and wipe the cache and the local store
    pub async fn sign_out(&self) -> Result<()> {
        {
            let mut current = self
                .scope
                .write()
                .map_err(|_| SyncError::Storage("scope lock poisoned".into()))?;
            *current = None;
        }
        self.context.cache.clear();

        let store = self.context.store.clone();
        tokio::task::spawn_blocking(move || store.clear_all()).await??;
        info!("Signed out");
        Ok(())
    }

    // ==================== Reads ====================

    /// Presentation view of a collection for the signed-in scope
    pub fn read(&self, collection: Collection) -> Result<QueryResult> {
        Ok(self.context.cache.read(&self.key(collection)?))
    }

    /// Pull every collection of the signed-in scope from the backend
    pub async fn sync(&self) -> Result<ResyncReport> {
        let scope = self.scope()?;
        let mut report = ResyncReport::default();
        for collection in Collection::ALL {
            let key = QueryKey::new(collection, scope.clone());
            match self.channel.resync_key(&key).await {
                Ok(RemoteOutcome::Applied) => report.applied += 1,
                Ok(RemoteOutcome::Deferred) => report.deferred += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Sync failed for collection");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Run due periodic resets for the signed-in scope
    pub async fn reset_now(&self) -> Result<Vec<ResetReport>> {
        Ok(self.resets.run_due(&self.scope()?).await)
    }
}
