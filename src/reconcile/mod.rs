//! Remote reconciliation channel
//!
//! Applies push-delivered changes to the cache. Changes for slots with a
//! mutation in flight are queued inside the cache and land once the mutation
//! confirms or rolls back. A reconnect triggers a full resync of every
//! subscribed key.

mod channel;

pub use channel::{ChannelEvent, ReconcileChannel, ResyncReport};
