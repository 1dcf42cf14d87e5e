//! Reactive query cache
//!
//! Keys are `(collection, scope)` tuples. Values are typed: an entity list,
//! the points ledger or the history log. See [`QueryCache`] for the
//! optimistic bookkeeping that rides alongside the values.

mod key;
mod query_cache;
mod value;

pub use key::{EntityRef, QueryKey};
pub use query_cache::{
    OptimisticChange, QueryCache, QueryFetcher, QueryResult, RemoteOutcome, RemoteWrite,
    SlotSnapshot, Subscriber, SubscriptionId,
};
pub use value::CacheValue;
