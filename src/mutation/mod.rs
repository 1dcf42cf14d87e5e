//! Optimistic mutation executor
//!
//! User intents are applied to the cache immediately, dispatched to the
//! backend, and then either confirmed with the server row or rolled back to
//! the exact pre-mutation snapshot.

mod executor;
mod intent;
mod locks;
mod phase;

pub use executor::{MutationExecutor, MutationOutcome};
pub use intent::{EntityDraft, EntityPatch};
pub use locks::EntityLocks;
pub use phase::MutationPhase;
