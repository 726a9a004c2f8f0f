//! Reconciliation engine
//!
//! Keeps each tracked collection's cache entry in agreement with the
//! remote collection:
//!
//! - snapshots **replace** the entry wholesale (last snapshot wins)
//! - writes go to the remote store first and are mirrored locally
//!   whatever the remote outcome; the next snapshot settles any divergence
//! - reads fall back to the cache when the remote store fails
//! - empty collections with a seed rule get one default record, once

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, SyncError, SyncResult};
use crate::models::{CollectionSpec, RemoteDocument, Snapshot};
use crate::remote::RemoteStore;
use crate::session::UserSession;
use crate::storage::{KvStore, SessionScope};

/// Value written to seed markers
const MARKER_SET: &str = "true";

/// Merges remote state into the local cache
pub struct Reconciler {
    kv: KvStore,
    remote: Arc<dyn RemoteStore>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").field("kv", &self.kv).finish()
    }
}

impl Reconciler {
    pub fn new(kv: KvStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self { kv, remote }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Cached records of a collection; empty when nothing is cached
    pub fn cached_records(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
    ) -> SyncResult<Vec<Value>> {
        Ok(SessionScope::new(&self.kv, session)
            .get_json::<Vec<Value>>(spec.local_key)?
            .unwrap_or_default())
    }

    /// Cached records, treating a corrupt entry as empty
    fn cached_records_lossy(&self, session: &UserSession, spec: &CollectionSpec) -> Vec<Value> {
        match self.cached_records(session, spec) {
            Ok(records) => records,
            Err(e) => {
                warn!("Discarding unreadable cache for '{}': {}", spec.local_key, e);
                Vec::new()
            }
        }
    }

    fn write_cache(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        records: &[Value],
    ) -> SyncResult<()> {
        SessionScope::new(&self.kv, session).set_json(spec.local_key, records)?;
        Ok(())
    }

    /// Replace the cache entry with exactly the snapshot's documents
    pub fn apply_snapshot(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        snapshot: &Snapshot,
    ) -> SyncResult<usize> {
        let records: Vec<Value> = snapshot.iter().map(RemoteDocument::to_record).collect();
        self.write_cache(session, spec, &records)?;
        debug!(
            "Applied snapshot of '{}' ({} documents) to '{}'",
            spec.remote_name,
            records.len(),
            session.scoped_key(spec.local_key)
        );
        Ok(records.len())
    }

    /// Create the collection's default record if it has never been seeded
    ///
    /// Returns the seeded document so the caller can push it remotely. The
    /// marker outlives the records: deleting everything later does not
    /// trigger a second seeding.
    pub fn seed_if_needed(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
    ) -> SyncResult<Option<RemoteDocument>> {
        let Some(seed) = spec.seed else {
            return Ok(None);
        };

        let scope = SessionScope::new(&self.kv, session);
        if scope.get(seed.marker_key)?.is_some() {
            return Ok(None);
        }

        if !self.cached_records_lossy(session, spec).is_empty() {
            // Existing data predates the marker
            scope.set(seed.marker_key, MARKER_SET)?;
            return Ok(None);
        }

        let doc = RemoteDocument::from_record((seed.factory)(session)).ok_or_else(|| {
            SyncError::InvalidRecord(format!("default record for '{}'", spec.remote_name))
        })?;

        self.write_cache(session, spec, &[doc.to_record()])?;
        scope.set(seed.marker_key, MARKER_SET)?;

        info!(
            "Seeded default record {} in '{}' for {}",
            doc.id, spec.remote_name, session.uid
        );
        Ok(Some(doc))
    }

    /// Overlay a document onto its cached record, or append it
    pub fn mirror_upsert(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        doc: &RemoteDocument,
    ) -> SyncResult<()> {
        let mut records = self.cached_records_lossy(session, spec);

        let position = records.iter().position(|r| has_id(r, &doc.id));
        match position {
            Some(i) => {
                records[i] = match RemoteDocument::from_record(records[i].take()) {
                    Some(mut existing) => {
                        existing.merge_from(&doc.data);
                        existing.to_record()
                    }
                    None => doc.to_record(),
                };
            }
            None => records.push(doc.to_record()),
        }

        self.write_cache(session, spec, &records)
    }

    /// Drop a record from the cache, returning whether it was there
    pub fn mirror_delete(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        id: &str,
    ) -> SyncResult<bool> {
        let mut records = self.cached_records_lossy(session, spec);
        let before = records.len();
        records.retain(|r| !has_id(r, id));
        let removed = records.len() != before;
        if removed {
            self.write_cache(session, spec, &records)?;
        }
        Ok(removed)
    }

    /// Remote set-with-merge only
    pub async fn push_upsert(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        doc: &RemoteDocument,
    ) -> Result<(), RemoteError> {
        let path = session.collection_path(spec.remote_name);
        self.remote
            .set_document(&path, &doc.id, doc.data.clone(), true)
            .await
    }

    /// Write path: remote first, then the local mirror
    ///
    /// The mirror happens even when the remote write fails and is not
    /// rolled back; the remote error is what the caller gets.
    pub async fn save(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        doc: &RemoteDocument,
    ) -> SyncResult<()> {
        let remote_result = self.push_upsert(session, spec, doc).await;

        if let Err(e) = self.mirror_upsert(session, spec, doc) {
            warn!("Local mirror of {}/{} failed: {}", spec.local_key, doc.id, e);
        }

        remote_result.map_err(|e| {
            warn!("Remote write of {}/{} failed: {}", spec.remote_name, doc.id, e);
            SyncError::Remote(e)
        })
    }

    /// Delete path, same failure rules as `save`
    pub async fn delete(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        id: &str,
    ) -> SyncResult<()> {
        let path = session.collection_path(spec.remote_name);
        let remote_result = self.remote.delete_document(&path, id).await;

        if let Err(e) = self.mirror_delete(session, spec, id) {
            warn!("Local delete of {}/{} failed: {}", spec.local_key, id, e);
        }

        remote_result.map_err(|e| {
            warn!("Remote delete of {}/{} failed: {}", spec.remote_name, id, e);
            SyncError::Remote(e)
        })
    }

    /// Read path: remote listing, cache on failure
    ///
    /// A successful listing replaces the cache like a snapshot would.
    pub async fn load(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
    ) -> SyncResult<Vec<Value>> {
        let path = session.collection_path(spec.remote_name);
        match self.remote.list_documents(&path).await {
            Ok(documents) => {
                self.apply_snapshot(session, spec, &documents)?;
                Ok(documents.iter().map(RemoteDocument::to_record).collect())
            }
            Err(e) => {
                warn!(
                    "Remote read of '{}' failed, serving cached data: {}",
                    spec.remote_name, e
                );
                self.cached_records(session, spec)
            }
        }
    }

    /// Read one record: remote document, cached copy on failure
    ///
    /// A successful read overwrites the cached record (or removes it when
    /// the remote document is gone).
    pub async fn load_one(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        id: &str,
    ) -> SyncResult<Option<Value>> {
        let path = session.collection_path(spec.remote_name);
        match self.remote.get_document(&path, id).await {
            Ok(Some(doc)) => {
                let record = doc.to_record();
                let mut records = self.cached_records_lossy(session, spec);
                match records.iter().position(|r| has_id(r, id)) {
                    Some(i) => records[i] = record.clone(),
                    None => records.push(record.clone()),
                }
                self.write_cache(session, spec, &records)?;
                Ok(Some(record))
            }
            Ok(None) => {
                self.mirror_delete(session, spec, id)?;
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "Remote read of {}/{} failed, serving cached copy: {}",
                    spec.remote_name, id, e
                );
                Ok(self
                    .cached_records(session, spec)?
                    .into_iter()
                    .find(|r| has_id(r, id)))
            }
        }
    }
}

fn has_id(record: &Value, id: &str) -> bool {
    record.get("id").and_then(Value::as_str) == Some(id)
}

/// Turn a caller-supplied record into a document
pub(crate) fn document_from_record(record: Value) -> SyncResult<RemoteDocument> {
    RemoteDocument::from_record(record)
        .ok_or_else(|| SyncError::InvalidRecord("record must be an object with a string id".into()))
}
