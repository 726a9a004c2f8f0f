//! Dependency acquisition
//!
//! The auth provider, remote store and snapshot bridge may be handed to
//! the sync core after it is constructed (they are usually initialised by
//! separate startup code). `Dependencies` is the barrier: providers fill
//! slots in any order, and `acquire` resolves once all three are present
//! or fails once the single timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{SyncError, SyncResult};
use crate::remote::{AuthProvider, RemoteStore, SnapshotBridge};

type Slot<T> = watch::Sender<Option<Arc<T>>>;

/// Slots for the three required collaborators
pub struct Dependencies {
    auth: Slot<dyn AuthProvider>,
    remote: Slot<dyn RemoteStore>,
    bridge: Slot<dyn SnapshotBridge>,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("auth", &self.auth.borrow().is_some())
            .field("remote", &self.remote.borrow().is_some())
            .field("bridge", &self.bridge.borrow().is_some())
            .finish()
    }
}

/// All three collaborators, once present
#[derive(Clone)]
pub struct Resolved {
    pub auth: Arc<dyn AuthProvider>,
    pub remote: Arc<dyn RemoteStore>,
    pub bridge: Arc<dyn SnapshotBridge>,
}

impl Dependencies {
    /// Empty slots
    pub fn new() -> Self {
        Self {
            auth: watch::channel(None).0,
            remote: watch::channel(None).0,
            bridge: watch::channel(None).0,
        }
    }

    /// Slots filled up front
    pub fn resolved(
        auth: Arc<dyn AuthProvider>,
        remote: Arc<dyn RemoteStore>,
        bridge: Arc<dyn SnapshotBridge>,
    ) -> Self {
        let deps = Self::new();
        deps.provide_auth(auth);
        deps.provide_remote(remote);
        deps.provide_bridge(bridge);
        deps
    }

    pub fn provide_auth(&self, auth: Arc<dyn AuthProvider>) {
        self.auth.send_replace(Some(auth));
    }

    pub fn provide_remote(&self, remote: Arc<dyn RemoteStore>) {
        self.remote.send_replace(Some(remote));
    }

    pub fn provide_bridge(&self, bridge: Arc<dyn SnapshotBridge>) {
        self.bridge.send_replace(Some(bridge));
    }

    /// Auth provider, if already provided
    pub fn auth(&self) -> Option<Arc<dyn AuthProvider>> {
        self.auth.borrow().clone()
    }

    /// Whether every slot is filled
    pub fn is_complete(&self) -> bool {
        self.auth.borrow().is_some()
            && self.remote.borrow().is_some()
            && self.bridge.borrow().is_some()
    }

    /// Wait until all three collaborators are present, for at most `budget`
    pub async fn acquire(&self, budget: Duration) -> SyncResult<Resolved> {
        let all = async {
            let (auth, remote, bridge) = tokio::join!(
                wait_for(&self.auth),
                wait_for(&self.remote),
                wait_for(&self.bridge)
            );
            Resolved {
                auth,
                remote,
                bridge,
            }
        };

        tokio::time::timeout(budget, all)
            .await
            .map_err(|_| SyncError::InitializationTimeout {
                waited_ms: budget.as_millis() as u64,
            })
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for<T: ?Sized>(slot: &Slot<T>) -> Arc<T> {
    let mut rx = slot.subscribe();
    loop {
        if let Some(value) = rx.borrow_and_update().clone() {
            return value;
        }
        // The sender lives in `slot`, which outlives this future
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
