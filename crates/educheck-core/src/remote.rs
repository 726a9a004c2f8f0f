//! Collaborator contracts consumed by the sync core
//!
//! - `AuthProvider`: who is signed in, and a stream of changes
//! - `RemoteStore`: document reads and writes
//! - `SnapshotBridge`: real-time collection change streams
//! - `ConnectivitySource`: online/offline flag
//!
//! The first three are the dependencies the lifecycle controller waits
//! for; connectivity is always available.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::error::RemoteError;
use crate::models::{RemoteDocument, Snapshot};
use crate::session::UserSession;

/// Authentication state
pub trait AuthProvider: Send + Sync {
    /// Currently signed-in user, if any
    fn current_session(&self) -> Option<UserSession>;

    /// Receiver that sees every sign-in and sign-out
    fn subscribe(&self) -> watch::Receiver<Option<UserSession>>;
}

/// Document store client
///
/// Paths are collection paths such as `users/{uid}/students`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All documents of a collection
    async fn list_documents(&self, path: &str) -> Result<Vec<RemoteDocument>, RemoteError>;

    /// One document, `None` if absent
    async fn get_document(&self, path: &str, id: &str)
        -> Result<Option<RemoteDocument>, RemoteError>;

    /// Write a document; with `merge` the fields are overlaid on any
    /// existing document instead of replacing it
    async fn set_document(
        &self,
        path: &str,
        id: &str,
        data: Map<String, Value>,
        merge: bool,
    ) -> Result<(), RemoteError>;

    /// Delete a document; deleting a missing document succeeds
    async fn delete_document(&self, path: &str, id: &str) -> Result<(), RemoteError>;
}

/// Unsubscribe callback of a change stream
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live change stream of one collection
pub struct Subscription {
    /// Full snapshots, the first one describing the current state
    pub snapshots: mpsc::UnboundedReceiver<Snapshot>,
    /// Stops delivery on the bridge side
    pub unsubscribe: Unsubscribe,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Real-time change stream provider
pub trait SnapshotBridge: Send + Sync {
    /// Start receiving snapshots of a collection
    fn subscribe(&self, path: &str) -> Result<Subscription, RemoteError>;
}

/// Online/offline event source
pub trait ConnectivitySource: Send + Sync {
    /// Receiver whose value is `true` while online
    fn subscribe(&self) -> watch::Receiver<bool>;

    /// Current connectivity
    fn is_online(&self) -> bool {
        *self.subscribe().borrow()
    }
}
