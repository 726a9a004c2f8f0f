//! Sync status, lifecycle state and events

use serde::Serialize;

use crate::session::UserSession;

/// Connection status, as shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No signed-in user
    Disconnected,
    /// Signed in and online; listeners are live
    Connected,
    /// Signed in but the network is gone
    Offline,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Disconnected => "disconnected",
            SyncStatus::Connected => "connected",
            SyncStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the controller itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Constructed, not started
    Uninitialized,
    /// Waiting for auth, remote store and snapshot bridge
    WaitingForDependencies,
    /// Dependencies resolved; auth and connectivity are being tracked
    Ready,
    /// Dependencies never appeared; terminal
    Failed,
}

/// Snapshot of the sync core's state for collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub status: SyncStatus,
    pub user: Option<UserSession>,
    pub online: bool,
    pub listeners_active: usize,
    pub is_ready: bool,
}

/// Events emitted by the sync core
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Dependencies resolved
    Ready,
    /// Dependencies never resolved; sync is unavailable
    InitializationFailed(String),
    /// Connection status changed
    StatusChanged(SyncStatus),
    /// A user signed in and listeners were installed
    SessionStarted(String),
    /// The session ended and listeners were torn down
    SessionEnded(String),
    /// A remote snapshot replaced a cache entry
    SnapshotApplied { collection: String, documents: usize },
    /// A default record was created for a collection
    Seeded { collection: String },
    /// Queued offline writes were sent
    QueueReplayed {
        applied: usize,
        rejected: usize,
        remaining: usize,
    },
    /// Error occurred
    Error(String),
}
