//! In-memory collaborators
//!
//! Process-local implementations of the auth, remote store, snapshot
//! bridge and connectivity contracts. Useful for embedding the sync core
//! without a backend and for exercising it in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::RemoteError;
use crate::models::{RemoteDocument, Snapshot};
use crate::remote::{AuthProvider, ConnectivitySource, RemoteStore, SnapshotBridge, Subscription};
use crate::session::UserSession;

/// Auth provider driven by explicit sign-in/sign-out calls
#[derive(Debug)]
pub struct MemoryAuth {
    tx: watch::Sender<Option<UserSession>>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Start with a user already signed in
    pub fn signed_in(session: UserSession) -> Self {
        let (tx, _rx) = watch::channel(Some(session));
        Self { tx }
    }

    pub fn sign_in(&self, session: UserSession) {
        self.tx.send_replace(Some(session));
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider for MemoryAuth {
    fn current_session(&self) -> Option<UserSession> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserSession>> {
        self.tx.subscribe()
    }
}

/// Connectivity flag flipped by hand
#[derive(Debug)]
pub struct MemoryConnectivity {
    tx: watch::Sender<bool>,
}

impl MemoryConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }
}

impl Default for MemoryConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivitySource for MemoryConnectivity {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Default)]
struct RemoteInner {
    collections: HashMap<String, BTreeMap<String, Map<String, Value>>>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Snapshot>)>>,
    next_subscriber: u64,
    fail_writes: Option<RemoteError>,
    fail_reads: Option<RemoteError>,
    /// `{path}/{id}` → error returned for writes to that document
    rejected: HashMap<String, RemoteError>,
    writes: usize,
}

impl RemoteInner {
    fn write_error(&self, path: &str, id: &str) -> Option<RemoteError> {
        self.fail_writes
            .clone()
            .or_else(|| self.rejected.get(&format!("{}/{}", path, id)).cloned())
    }

    fn snapshot(&self, path: &str) -> Snapshot {
        self.collections
            .get(path)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| RemoteDocument::new(id.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast(&mut self, path: &str) {
        let snapshot = self.snapshot(path);
        if let Some(subs) = self.subscribers.get_mut(path) {
            subs.retain(|(_, tx)| tx.send(snapshot.clone()).is_ok());
        }
    }
}

/// Document store and snapshot bridge in one
///
/// Every successful write broadcasts a fresh snapshot of the touched
/// collection to its subscribers, like a real-time backend would.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<RemoteInner>>,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote").finish_non_exhaustive()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, RemoteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace a collection's contents as if another device wrote it,
    /// notifying subscribers
    pub fn replace_collection(&self, path: &str, documents: Vec<RemoteDocument>) {
        let mut inner = self.inner();
        let docs = documents.into_iter().map(|d| (d.id, d.data)).collect();
        inner.collections.insert(path.to_string(), docs);
        inner.broadcast(path);
    }

    /// Current documents of a collection
    pub fn documents(&self, path: &str) -> Vec<RemoteDocument> {
        self.inner().snapshot(path)
    }

    /// Make every write fail with `error` (or succeed again with `None`)
    pub fn fail_writes(&self, error: Option<RemoteError>) {
        self.inner().fail_writes = error;
    }

    /// Make writes to one document fail with `error` (or succeed again
    /// with `None`)
    pub fn reject_document(&self, path: &str, id: &str, error: Option<RemoteError>) {
        let key = format!("{}/{}", path, id);
        let mut inner = self.inner();
        match error {
            Some(error) => {
                inner.rejected.insert(key, error);
            }
            None => {
                inner.rejected.remove(&key);
            }
        }
    }

    /// Make every read fail with `error` (or succeed again with `None`)
    pub fn fail_reads(&self, error: Option<RemoteError>) {
        self.inner().fail_reads = error;
    }

    /// Live subscriptions on a collection
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.inner()
            .subscribers
            .get(path)
            .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Successful writes and deletes so far
    pub fn write_count(&self) -> usize {
        self.inner().writes
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_documents(&self, path: &str) -> Result<Vec<RemoteDocument>, RemoteError> {
        let inner = self.inner();
        if let Some(err) = &inner.fail_reads {
            return Err(err.clone());
        }
        Ok(inner.snapshot(path))
    }

    async fn get_document(
        &self,
        path: &str,
        id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError> {
        let inner = self.inner();
        if let Some(err) = &inner.fail_reads {
            return Err(err.clone());
        }
        Ok(inner
            .collections
            .get(path)
            .and_then(|docs| docs.get(id))
            .map(|data| RemoteDocument::new(id, data.clone())))
    }

    async fn set_document(
        &self,
        path: &str,
        id: &str,
        data: Map<String, Value>,
        merge: bool,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner();
        if let Some(err) = inner.write_error(path, id) {
            return Err(err);
        }

        let docs = inner.collections.entry(path.to_string()).or_default();
        match docs.get_mut(id) {
            Some(existing) if merge => existing.extend(data),
            _ => {
                docs.insert(id.to_string(), data);
            }
        }
        inner.writes += 1;
        debug!("memory remote: set {}/{}", path, id);
        inner.broadcast(path);
        Ok(())
    }

    async fn delete_document(&self, path: &str, id: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner();
        if let Some(err) = inner.write_error(path, id) {
            return Err(err);
        }

        if let Some(docs) = inner.collections.get_mut(path) {
            docs.remove(id);
        }
        inner.writes += 1;
        inner.broadcast(path);
        Ok(())
    }
}

impl SnapshotBridge for MemoryRemote {
    fn subscribe(&self, path: &str) -> Result<Subscription, RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;

        // Initial snapshot, like the first listener callback
        let _ = tx.send(inner.snapshot(path));
        inner
            .subscribers
            .entry(path.to_string())
            .or_default()
            .push((id, tx));
        drop(inner);

        let weak = Arc::downgrade(&self.inner);
        let path = path.to_string();
        let unsubscribe = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(subs) = inner.subscribers.get_mut(&path) {
                    subs.retain(|(sub_id, _)| *sub_id != id);
                }
            }
        });

        Ok(Subscription {
            snapshots: rx,
            unsubscribe,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_set_with_merge_overlays() {
        let remote = MemoryRemote::new();
        let path = "users/u1/students";

        remote
            .set_document(path, "s1", fields(json!({"name": "Ada", "age": 11})), true)
            .await
            .unwrap();
        remote
            .set_document(path, "s1", fields(json!({"age": 12})), true)
            .await
            .unwrap();

        let doc = remote.get_document(path, "s1").await.unwrap().unwrap();
        assert_eq!(doc.to_record(), json!({"id": "s1", "name": "Ada", "age": 12}));

        remote
            .set_document(path, "s1", fields(json!({"age": 13})), false)
            .await
            .unwrap();
        let doc = remote.get_document(path, "s1").await.unwrap().unwrap();
        assert_eq!(doc.to_record(), json!({"id": "s1", "age": 13}));
        assert_eq!(remote.write_count(), 3);
    }

    #[tokio::test]
    async fn test_subscription_gets_initial_and_updates() {
        let remote = MemoryRemote::new();
        let path = "users/u1/activities";

        let mut sub = remote.subscribe(path).unwrap();
        assert!(sub.snapshots.recv().await.unwrap().is_empty());

        remote
            .set_document(path, "a1", fields(json!({"title": "Chess"})), true)
            .await
            .unwrap();
        let snapshot = sub.snapshots.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "a1");

        assert_eq!(remote.subscriber_count(path), 1);
        (sub.unsubscribe)();
        assert_eq!(remote.subscriber_count(path), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = MemoryRemote::new();
        remote.fail_writes(Some(RemoteError::Unavailable("offline".into())));

        let err = remote
            .set_document("p", "x", Map::new(), true)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(remote.write_count(), 0);

        remote.fail_reads(Some(RemoteError::Other("boom".into())));
        assert!(remote.list_documents("p").await.is_err());

        remote.fail_writes(None);
        remote.reject_document("p", "x", Some(RemoteError::PermissionDenied { path: "p/x".into() }));
        assert!(remote.set_document("p", "x", Map::new(), true).await.is_err());
        assert!(remote.set_document("p", "y", Map::new(), true).await.is_ok());
        remote.reject_document("p", "x", None);
        assert!(remote.delete_document("p", "x").await.is_ok());
    }

    #[test]
    fn test_auth_and_connectivity() {
        let auth = MemoryAuth::new();
        let rx = auth.subscribe();
        assert!(auth.current_session().is_none());

        auth.sign_in(UserSession::new("u1"));
        assert_eq!(rx.borrow().as_ref().map(|s| s.uid.as_str()), Some("u1"));
        auth.sign_out();
        assert!(auth.current_session().is_none());

        let net = MemoryConnectivity::default();
        assert!(net.is_online());
        net.set_online(false);
        assert!(!net.is_online());
    }
}
