//! Sync between the local cache and the remote document store
//!
//! ## Flow
//!
//! 1. `SyncManager::initialize` waits (once, with one timeout) for the auth
//!    provider, remote store and snapshot bridge
//! 2. On sign-in, empty collections are seeded and one snapshot listener per
//!    collection is installed under `users/{uid}/{collection}`
//! 3. Every snapshot replaces the matching cache entry
//! 4. Writes go remote first and are mirrored locally; while offline they
//!    are mirrored and queued instead
//! 5. On sign-out or user switch all listeners are torn down before any new
//!    ones are installed
//!
//! ## Usage
//!
//! ```ignore
//! let manager = SyncManager::new(config, kv, deps, connectivity);
//! let mut events = manager.take_events().unwrap();
//! manager.start();
//! ```

mod dependencies;
mod manager;
mod queue;
mod reconcile;
mod registry;
mod status;

pub use dependencies::{Dependencies, Resolved};
pub use manager::{SyncManager, WriteOutcome};
pub use queue::{OfflineQueue, OfflineQueueEntry, QueuedWrite, ReplayReport, QUEUE_KEY};
pub use reconcile::Reconciler;
pub use registry::{ListenerHandle, ListenerRegistry};
pub use status::{LifecycleState, SyncEvent, SyncStatus, SyncStatusReport};
