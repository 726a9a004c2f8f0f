//! Public entry point
//!
//! `EduCheck` is what the rest of the application talks to. It wraps a
//! shared `SyncManager` and keeps working before sync is ready: user data
//! calls then fall back to the session the auth provider reports, and do
//! nothing when nobody is known to be signed in.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::SyncResult;
use crate::models::Institution;
use crate::remote::ConnectivitySource;
use crate::storage::scoped::{get_logged, remove_logged, set_logged};
use crate::storage::KvStore;
use crate::sync::{Dependencies, SyncEvent, SyncManager, SyncStatusReport, WriteOutcome};

/// Handle to the sync core; cheap to clone
#[derive(Debug, Clone)]
pub struct EduCheck {
    manager: Arc<SyncManager>,
}

impl EduCheck {
    /// Open the on-disk cache described by `config` and build a core
    ///
    /// Call [`EduCheck::start`] afterwards to begin waiting for dependencies.
    pub fn open(
        config: Config,
        deps: Arc<Dependencies>,
        connectivity: Arc<dyn ConnectivitySource>,
    ) -> SyncResult<Self> {
        let kv = KvStore::open(&config)?;
        Ok(Self::new(SyncManager::new(config, kv, deps, connectivity)))
    }

    pub fn new(manager: Arc<SyncManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    /// Start initialisation in the background
    pub fn start(&self) -> JoinHandle<()> {
        self.manager.start()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.manager.take_events()
    }

    // ==================== User data ====================

    /// Read a per-user value
    pub fn get_user_data(&self, key: &str) -> Option<String> {
        if self.manager.is_ready() {
            return self.manager.local().get(key);
        }
        let session = self.manager.known_session()?;
        get_logged(self.manager.kv(), &session, key)
    }

    /// Write a per-user value
    pub fn set_user_data(&self, key: &str, value: &str) {
        if self.manager.is_ready() {
            self.manager.local().set(key, value);
        } else if let Some(session) = self.manager.known_session() {
            set_logged(self.manager.kv(), &session, key, value);
        }
    }

    /// Delete a per-user value
    pub fn remove_user_data(&self, key: &str) {
        if self.manager.is_ready() {
            self.manager.local().remove(key);
        } else if let Some(session) = self.manager.known_session() {
            remove_logged(self.manager.kv(), &session, key);
        }
    }

    pub fn sync_status(&self) -> SyncStatusReport {
        self.manager.sync_status()
    }

    // ==================== Collections ====================

    pub async fn save_record(&self, collection: &str, record: Value) -> SyncResult<WriteOutcome> {
        self.manager.save_record(collection, record).await
    }

    pub async fn save_institution(&self, institution: &Institution) -> SyncResult<WriteOutcome> {
        self.manager.save_institution(institution).await
    }

    pub async fn delete_record(&self, collection: &str, id: &str) -> SyncResult<WriteOutcome> {
        self.manager.delete_record(collection, id).await
    }

    pub async fn load_records(&self, collection: &str) -> SyncResult<Vec<Value>> {
        self.manager.load_records(collection).await
    }

    pub async fn load_record(&self, collection: &str, id: &str) -> SyncResult<Option<Value>> {
        self.manager.load_record(collection, id).await
    }
}
