//! Keeps the offline caches in step with favourite membership.
//!
//! - [`events`] - `SyncEvent` notifications and the `EventBus` that carries them
//! - [`coordinator`] - per-recipe add/remove and startup reconciliation
//! - [`favourites`] - the user-facing toggle that commits first and syncs detached

mod coordinator;
mod events;
mod favourites;

pub use coordinator::{AddOutcome, ReconcileReport, SyncCoordinator, SyncError};
pub use events::{EventBus, SyncEvent};
pub use favourites::{Favourites, ToggleOutcome};
