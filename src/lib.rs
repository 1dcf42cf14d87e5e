//! tracker-sync: offline-first optimistic sync engine for the tracker app
//!
//! Lets a client mutate tasks, rules, rewards and punishments instantly,
//! persist them on-device, reconcile them against the hosted backend and roll
//! back cleanly on failure, while the points ledger stays consistent.
//!
//! ## Components
//!
//! - [`store`]: durable per-collection persistence (SQLite)
//! - [`cache`]: reactive query cache keyed by `(collection, scope)`
//! - [`mutation`]: optimistic mutation executor
//! - [`reconcile`]: merges push-delivered server changes
//! - [`reset`]: daily/weekly usage counter resets
//!
//! [`SyncEngine`] wires them together around one [`SyncContext`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tracker_sync::{Config, SyncContext, SyncEngine};
//! use tracker_sync::mutation::EntityDraft;
//! use tracker_sync::model::Frequency;
//! use tracker_sync::remote::InMemoryBackend;
//! use tracker_sync::store::MemoryStore;
//!
//! # async fn example() -> tracker_sync::Result<()> {
//! let context = SyncContext::new(
//!     Config::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryBackend::new()),
//! );
//! let engine = SyncEngine::new(context);
//! engine.sign_in("household-1".into()).await?;
//!
//! let scope = engine.scope()?;
//! let created = engine
//!     .executor()
//!     .create(&scope, EntityDraft::task("Dishes", 10, Frequency::Daily))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod mutation;
pub mod reconcile;
pub mod remote;
pub mod reset;
pub mod store;

pub use config::Config;
pub use engine::{SyncContext, SyncEngine};
pub use error::{Result, SyncError};
