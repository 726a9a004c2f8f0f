//! Offline write queue
//!
//! Writes made while offline are persisted per user under
//! `{uid}_offlineQueue` and replayed, oldest first, once connectivity
//! returns. An entry is removed as soon as it has been applied, so an
//! interrupted replay can simply run again. Entries the remote store
//! rejects outright are dropped; only transient failures keep them queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RemoteError, SyncResult};
use crate::remote::RemoteStore;
use crate::session::UserSession;
use crate::storage::{KvStore, SessionScope};

/// Logical cache key of the queue
pub const QUEUE_KEY: &str = "offlineQueue";

/// The remote operation a queue entry stands for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueuedWrite {
    /// Set-with-merge of one document
    #[serde(rename_all = "camelCase")]
    Upsert {
        doc_id: String,
        data: Map<String, Value>,
    },
    /// Delete of one document
    #[serde(rename_all = "camelCase")]
    Delete { doc_id: String },
}

impl QueuedWrite {
    pub fn doc_id(&self) -> &str {
        match self {
            QueuedWrite::Upsert { doc_id, .. } | QueuedWrite::Delete { doc_id } => doc_id,
        }
    }
}

/// A pending write recorded while offline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineQueueEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Remote collection name (e.g. `institutions`)
    pub collection: String,
    pub write: QueuedWrite,
}

/// Outcome of a replay pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplayReport {
    pub applied: usize,
    pub remaining: usize,
    /// Entries dropped because the remote store refused them for good
    pub rejected: Vec<(OfflineQueueEntry, RemoteError)>,
    /// Transient error that stopped the pass, if any
    pub error: Option<RemoteError>,
}

/// Persisted per-user queue of offline writes
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    kv: KvStore,
}

impl OfflineQueue {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    fn load(&self, session: &UserSession) -> SyncResult<Vec<OfflineQueueEntry>> {
        let mut entries: Vec<OfflineQueueEntry> = SessionScope::new(&self.kv, session)
            .get_json(QUEUE_KEY)?
            .unwrap_or_default();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    fn store(&self, session: &UserSession, entries: &[OfflineQueueEntry]) -> SyncResult<()> {
        let scope = SessionScope::new(&self.kv, session);
        if entries.is_empty() {
            scope.remove(QUEUE_KEY)?;
        } else {
            scope.set_json(QUEUE_KEY, entries)?;
        }
        Ok(())
    }

    /// Append a write
    pub fn enqueue(
        &self,
        session: &UserSession,
        collection: &str,
        write: QueuedWrite,
    ) -> SyncResult<OfflineQueueEntry> {
        let entry = OfflineQueueEntry {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            collection: collection.to_string(),
            write,
        };

        let mut entries = self.load(session)?;
        entries.push(entry.clone());
        self.store(session, &entries)?;

        debug!(
            "Queued offline write {} for {}/{}",
            entry.id,
            collection,
            entry.write.doc_id()
        );
        Ok(entry)
    }

    /// Pending entries, oldest first
    pub fn pending(&self, session: &UserSession) -> SyncResult<Vec<OfflineQueueEntry>> {
        self.load(session)
    }

    pub fn len(&self, session: &UserSession) -> SyncResult<usize> {
        Ok(self.load(session)?.len())
    }

    pub fn is_empty(&self, session: &UserSession) -> SyncResult<bool> {
        Ok(self.len(session)? == 0)
    }

    fn remove(&self, session: &UserSession, id: Uuid) -> SyncResult<()> {
        let mut entries = self.load(session)?;
        entries.retain(|e| e.id != id);
        self.store(session, &entries)
    }

    /// Send pending writes in creation order
    ///
    /// Stops at the first transient failure; that entry and everything
    /// after it stay queued for the next attempt. Any other failure drops
    /// the entry and moves on.
    pub async fn replay(
        &self,
        session: &UserSession,
        remote: &dyn RemoteStore,
    ) -> SyncResult<ReplayReport> {
        let entries = self.load(session)?;
        let mut report = ReplayReport::default();

        for (index, entry) in entries.iter().enumerate() {
            let path = session.collection_path(&entry.collection);
            let result = match &entry.write {
                QueuedWrite::Upsert { doc_id, data } => {
                    remote.set_document(&path, doc_id, data.clone(), true).await
                }
                QueuedWrite::Delete { doc_id } => remote.delete_document(&path, doc_id).await,
            };

            match result {
                Ok(()) => {
                    self.remove(session, entry.id)?;
                    report.applied += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!("Replay of queued write {} failed: {}", entry.id, e);
                    report.remaining = entries.len() - index;
                    report.error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!("Dropping queued write {}: {}", entry.id, e);
                    self.remove(session, entry.id)?;
                    report.rejected.push((entry.clone(), e));
                }
            }
        }

        Ok(report)
    }
}
