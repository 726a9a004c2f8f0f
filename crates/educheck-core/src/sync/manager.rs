//! Connectivity & lifecycle controller
//!
//! `SyncManager` owns the sync core's moving parts: it waits for its
//! dependencies, follows auth and connectivity changes, installs and tears
//! down snapshot listeners, and routes collection writes either to the
//! remote store or to the offline queue.
//!
//! ## Lifecycle
//!
//! `Uninitialized → WaitingForDependencies → Ready | Failed`
//!
//! `Failed` is terminal: nothing retries, and the facade keeps serving
//! best-effort local reads and writes.
//!
//! ## Ordering
//!
//! Every auth transition tears down the previous session's listeners
//! before the next session's are installed. Transitions are serialised, so
//! this holds even when they are requested concurrently.
//!
//! Transitions never wait on the network. Pushing seeded records and
//! replaying the offline queue run as background work owned by the
//! session; `stop_sync` aborts it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dependencies::{Dependencies, Resolved};
use super::queue::{OfflineQueue, QueuedWrite, ReplayReport};
use super::reconcile::{document_from_record, Reconciler};
use super::registry::{ListenerHandle, ListenerRegistry};
use super::status::{LifecycleState, SyncEvent, SyncStatus, SyncStatusReport};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::models::{CollectionSpec, Institution, RemoteDocument, Snapshot, DEFAULT_COLLECTIONS, INSTITUTIONS};
use crate::remote::{ConnectivitySource, Subscription};
use crate::session::UserSession;
use crate::storage::{KvStore, SessionScope, UserScopedStore};

/// Where a collection write ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accepted by the remote store
    Committed,
    /// Stored in the offline queue for replay on reconnect
    Queued,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event sender that exists only once the receiver has been taken
///
/// Until then events are discarded instead of piling up.
#[derive(Clone, Default)]
struct EventSink(Arc<Mutex<Option<mpsc::UnboundedSender<SyncEvent>>>>);

impl EventSink {
    fn emit(&self, event: SyncEvent) {
        if let Some(tx) = locked(&self.0).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn attach(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        let mut slot = locked(&self.0);
        if slot.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Some(rx)
    }

    #[cfg(test)]
    fn is_attached(&self) -> bool {
        locked(&self.0).is_some()
    }
}

/// The sync core's controller
pub struct SyncManager {
    config: Config,
    collections: Vec<CollectionSpec>,
    kv: KvStore,
    /// Active session; the only writer is the transition path
    session: watch::Sender<Option<UserSession>>,
    local: UserScopedStore,
    deps: Arc<Dependencies>,
    connectivity: Arc<dyn ConnectivitySource>,
    online: AtomicBool,
    lifecycle: watch::Sender<LifecycleState>,
    status: watch::Sender<SyncStatus>,
    resolved: OnceLock<Resolved>,
    reconciler: OnceLock<Arc<Reconciler>>,
    registry: Mutex<ListenerRegistry>,
    queue: OfflineQueue,
    /// Serialises auth and connectivity transitions
    transition: tokio::sync::Mutex<()>,
    /// Background remote work of the active session
    session_work: Mutex<Vec<JoinHandle<()>>>,
    /// Runs session work one task at a time
    work_lock: Arc<tokio::sync::Mutex<()>>,
    events: EventSink,
    shutdown: Arc<Notify>,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("lifecycle", &self.lifecycle_state())
            .field("status", &self.status())
            .field("session", &self.session())
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Create a manager tracking the default collections
    pub fn new(
        config: Config,
        kv: KvStore,
        deps: Arc<Dependencies>,
        connectivity: Arc<dyn ConnectivitySource>,
    ) -> Arc<Self> {
        Self::with_collections(config, kv, deps, connectivity, DEFAULT_COLLECTIONS.to_vec())
    }

    /// Create a manager tracking a specific set of collections
    pub fn with_collections(
        config: Config,
        kv: KvStore,
        deps: Arc<Dependencies>,
        connectivity: Arc<dyn ConnectivitySource>,
        collections: Vec<CollectionSpec>,
    ) -> Arc<Self> {
        let (session_tx, session_rx) = watch::channel(None);
        let online = connectivity.is_online();

        Arc::new(Self {
            config,
            collections,
            local: UserScopedStore::new(kv.clone(), session_rx),
            queue: OfflineQueue::new(kv.clone()),
            kv,
            session: session_tx,
            deps,
            connectivity,
            online: AtomicBool::new(online),
            lifecycle: watch::channel(LifecycleState::Uninitialized).0,
            status: watch::channel(SyncStatus::Disconnected).0,
            resolved: OnceLock::new(),
            reconciler: OnceLock::new(),
            registry: Mutex::new(ListenerRegistry::new()),
            transition: tokio::sync::Mutex::new(()),
            session_work: Mutex::new(Vec::new()),
            work_lock: Arc::new(tokio::sync::Mutex::new(())),
            events: EventSink::default(),
            shutdown: Arc::new(Notify::new()),
            lifecycle_task: Mutex::new(None),
        })
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn collections(&self) -> &[CollectionSpec] {
        &self.collections
    }

    /// The unscoped cache
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Cache adapter scoped by the active session
    pub fn local(&self) -> &UserScopedStore {
        &self.local
    }

    pub fn dependencies(&self) -> &Arc<Dependencies> {
        &self.deps
    }

    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle_state() == LifecycleState::Ready
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Active session
    pub fn session(&self) -> Option<UserSession> {
        self.session.borrow().clone()
    }

    /// Best guess at the signed-in user, even before readiness
    ///
    /// The active session once there is one; otherwise whatever the auth
    /// provider reports, if it has been provided yet and its uid is usable.
    pub fn known_session(&self) -> Option<UserSession> {
        self.session().or_else(|| {
            self.deps
                .auth()
                .and_then(|auth| auth.current_session())
                .filter(UserSession::is_valid)
        })
    }

    /// Number of installed listeners
    pub fn listeners_active(&self) -> usize {
        locked(&self.registry).len()
    }

    /// Collections with an installed listener, sorted
    pub fn listened_collections(&self) -> Vec<String> {
        locked(&self.registry).collections()
    }

    /// Status snapshot for collaborators
    pub fn sync_status(&self) -> SyncStatusReport {
        SyncStatusReport {
            status: self.status(),
            user: self.session(),
            online: self.is_online(),
            listeners_active: self.listeners_active(),
            is_ready: self.is_ready(),
        }
    }

    /// Take the event receiver (can only be called once)
    ///
    /// Events emitted before this call are not kept.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.events.attach()
    }

    fn reconciler(&self) -> SyncResult<&Arc<Reconciler>> {
        self.reconciler.get().ok_or(SyncError::NotReady)
    }

    fn spec(&self, collection: &str) -> SyncResult<CollectionSpec> {
        self.collections
            .iter()
            .find(|c| c.remote_name == collection || c.local_key == collection)
            .copied()
            .ok_or_else(|| SyncError::UnknownCollection(collection.to_string()))
    }

    fn emit(&self, event: SyncEvent) {
        self.events.emit(event);
    }

    fn set_status(&self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("Sync status: {}", status);
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    fn status_for_session(&self) -> SyncStatus {
        match (self.session.borrow().is_some(), self.is_online()) {
            (false, _) => SyncStatus::Disconnected,
            (true, true) => SyncStatus::Connected,
            (true, false) => SyncStatus::Offline,
        }
    }

    // ==================== Lifecycle ====================

    /// Start initialisation in the background
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            // Failures are logged and reported as events
            let _ = manager.initialize().await;
        })
    }

    /// Wait for dependencies, then begin tracking auth and connectivity
    ///
    /// Runs once. Calling again after success is a no-op; calling again
    /// after failure returns `NotReady` without retrying.
    pub async fn initialize(self: &Arc<Self>) -> SyncResult<()> {
        let started = self.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Uninitialized {
                *state = LifecycleState::WaitingForDependencies;
                true
            } else {
                false
            }
        });
        if !started {
            return if self.is_ready() {
                Ok(())
            } else {
                Err(SyncError::NotReady)
            };
        }

        info!(
            "Waiting up to {}ms for sync dependencies",
            self.config.init_timeout_ms
        );

        let resolved = match self.deps.acquire(self.config.init_timeout()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Sync initialization failed: {}. Sync is unavailable.", e);
                self.lifecycle.send_replace(LifecycleState::Failed);
                self.emit(SyncEvent::InitializationFailed(e.to_string()));
                return Err(e);
            }
        };

        let reconciler = Arc::new(Reconciler::new(self.kv.clone(), resolved.remote.clone()));
        let mut auth_rx = resolved.auth.subscribe();
        let mut online_rx = self.connectivity.subscribe();
        let _ = self.reconciler.set(reconciler);
        let _ = self.resolved.set(resolved);

        self.lifecycle.send_replace(LifecycleState::Ready);
        info!("Sync dependencies resolved");
        self.emit(SyncEvent::Ready);

        let online = *online_rx.borrow_and_update();
        self.handle_connectivity_change(online).await;
        let initial = auth_rx.borrow_and_update().clone();
        self.handle_auth_change(initial).await;

        let task = tokio::spawn(run_lifecycle(
            Arc::downgrade(self),
            auth_rx,
            online_rx,
            self.shutdown.clone(),
        ));
        *locked(&self.lifecycle_task) = Some(task);

        Ok(())
    }

    /// Stop following auth/connectivity and tear down all listeners
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
        if let Some(task) = locked(&self.lifecycle_task).take() {
            task.abort();
        }
        self.stop_sync();
    }

    /// React to a sign-in, sign-out or user switch
    pub async fn handle_auth_change(&self, next: Option<UserSession>) {
        let next = next.filter(|session| match session.validate() {
            Ok(()) => true,
            Err(e) => {
                error!("Ignoring session from auth provider: {}", e);
                self.emit(SyncEvent::Error(e.to_string()));
                false
            }
        });

        let _transition = self.transition.lock().await;

        let current_uid = self.session().map(|s| s.uid);
        if current_uid.as_deref() == next.as_ref().map(|s| s.uid.as_str()) {
            // Same user (or still nobody): refresh profile fields only
            if next.is_some() {
                self.session.send_replace(next);
            }
            return;
        }

        // Teardown strictly precedes setup
        self.end_session();

        if let Some(session) = next {
            self.begin_session(session);
        }
    }

    /// React to the network going away or coming back
    ///
    /// Only the status changes; listeners stay registered.
    pub async fn handle_connectivity_change(&self, online: bool) {
        let _transition = self.transition.lock().await;

        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            info!("Connectivity: {}", if online { "online" } else { "offline" });
        }
        self.set_status(self.status_for_session());

        if online && !was_online {
            if let Some(work) = self.session_context() {
                self.spawn_session_work(work, Vec::new(), true);
            }
        }
    }

    fn end_session(&self) {
        self.stop_sync();
        if let Some(previous) = self.session.send_replace(None) {
            info!("Session ended for {}", previous.uid);
            self.emit(SyncEvent::SessionEnded(previous.uid));
        }
        self.set_status(SyncStatus::Disconnected);
    }

    fn begin_session(&self, session: UserSession) {
        info!("Session started for {}", session.uid);
        let uid = session.uid.clone();
        self.session.send_replace(Some(session));
        self.set_status(self.status_for_session());

        if let Err(e) = self.start_sync() {
            warn!("Failed to start sync for {}: {}", uid, e);
            self.emit(SyncEvent::Error(e.to_string()));
        }
        self.emit(SyncEvent::SessionStarted(uid));
    }

    // ==================== Sync ====================

    /// Seed empty collections and install one listener per tracked
    /// collection for the active session
    ///
    /// Seeded records are pushed, and the offline queue replayed, in the
    /// background.
    pub fn start_sync(&self) -> SyncResult<()> {
        let reconciler = self.reconciler()?.clone();
        let session = self.session().ok_or(SyncError::NoSession)?;

        let mut seeds = Vec::new();
        for spec in &self.collections {
            match reconciler.seed_if_needed(&session, spec) {
                Ok(Some(doc)) => {
                    self.emit(SyncEvent::Seeded {
                        collection: spec.remote_name.to_string(),
                    });
                    if self.should_queue() {
                        if let Err(e) = self.queue.enqueue(&session, spec.remote_name, upsert(&doc)) {
                            warn!("Default record for '{}' not queued: {}", spec.remote_name, e);
                        }
                    } else {
                        seeds.push((*spec, doc));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Seeding '{}' failed: {}", spec.remote_name, e),
            }
        }

        for spec in &self.collections {
            if let Err(e) = self.register_listener(spec) {
                warn!("Listener for '{}' not installed: {}", spec.remote_name, e);
                self.emit(SyncEvent::Error(e.to_string()));
            }
        }

        let replay = self.is_online();
        if !seeds.is_empty() || replay {
            if let Some(work) = self.session_context() {
                self.spawn_session_work(work, seeds, replay);
            }
        }

        debug!(
            "Sync started for {} ({} listeners)",
            session.uid,
            self.listeners_active()
        );
        Ok(())
    }

    /// Tear down every listener and abort pending session work; safe to
    /// call repeatedly
    pub fn stop_sync(&self) {
        for task in locked(&self.session_work).drain(..) {
            task.abort();
        }
        let torn_down = locked(&self.registry).teardown_all();
        if torn_down > 0 {
            debug!("Tore down {} listeners", torn_down);
        }
    }

    /// Subscribe to one collection for the active session
    ///
    /// Replaces any listener already installed for the collection.
    pub fn register_listener(&self, spec: &CollectionSpec) -> SyncResult<()> {
        let (Some(resolved), Some(reconciler)) = (self.resolved.get(), self.reconciler.get())
        else {
            warn!(
                "Listener for '{}' requested before sync is ready",
                spec.remote_name
            );
            return Err(SyncError::NotReady);
        };
        let session = self.session().ok_or(SyncError::NoSession)?;

        let path = session.collection_path(spec.remote_name);
        let Subscription {
            snapshots,
            unsubscribe,
        } = resolved.bridge.subscribe(&path)?;

        let context = ListenerContext {
            session: session.clone(),
            spec: *spec,
            reconciler: reconciler.clone(),
            current: self.session.subscribe(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(deliver_snapshots(context, snapshots));

        locked(&self.registry).insert(ListenerHandle::new(
            spec.remote_name,
            session.uid,
            unsubscribe,
            Some(task),
        ));
        debug!("Listening to {}", path);
        Ok(())
    }

    fn session_context(&self) -> Option<SessionWork> {
        Some(SessionWork {
            session: self.session()?,
            reconciler: self.reconciler.get()?.clone(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            queue_enabled: self.config.offline_queue_enabled,
        })
    }

    /// Run remote work for the active session off the transition path
    fn spawn_session_work(
        &self,
        work: SessionWork,
        seeds: Vec<(CollectionSpec, RemoteDocument)>,
        replay: bool,
    ) {
        let serial = self.work_lock.clone();
        let task = tokio::spawn(async move {
            let _serial = serial.lock().await;
            work.push_seeds(seeds).await;
            if replay {
                work.replay().await;
            }
        });

        let mut pending = locked(&self.session_work);
        pending.retain(|t| !t.is_finished());
        pending.push(task);
    }

    fn should_queue(&self) -> bool {
        self.config.offline_queue_enabled && !self.is_online()
    }

    async fn write_document(
        &self,
        session: &UserSession,
        spec: &CollectionSpec,
        doc: &RemoteDocument,
    ) -> SyncResult<WriteOutcome> {
        let reconciler = self.reconciler()?;

        if self.should_queue() {
            if let Err(e) = reconciler.mirror_upsert(session, spec, doc) {
                warn!("Local mirror of {}/{} failed: {}", spec.local_key, doc.id, e);
            }
            self.queue.enqueue(session, spec.remote_name, upsert(doc))?;
            return Ok(WriteOutcome::Queued);
        }

        reconciler.save(session, spec, doc).await?;
        Ok(WriteOutcome::Committed)
    }

    // ==================== Collection operations ====================

    /// Save a record (`{"id": .., ...}`) to a tracked collection
    ///
    /// Online: remote set-with-merge, mirrored locally even if the remote
    /// write fails. Offline: mirrored locally and queued.
    pub async fn save_record(&self, collection: &str, record: Value) -> SyncResult<WriteOutcome> {
        let spec = self.spec(collection)?;
        let session = self.session().ok_or(SyncError::NoSession)?;
        let doc = document_from_record(record)?;
        self.write_document(&session, &spec, &doc).await
    }

    /// Save an institution
    pub async fn save_institution(&self, institution: &Institution) -> SyncResult<WriteOutcome> {
        let record = serde_json::to_value(institution)?;
        self.save_record(INSTITUTIONS.remote_name, record).await
    }

    /// Delete a record from a tracked collection
    pub async fn delete_record(&self, collection: &str, id: &str) -> SyncResult<WriteOutcome> {
        let spec = self.spec(collection)?;
        let session = self.session().ok_or(SyncError::NoSession)?;
        let reconciler = self.reconciler()?;

        if self.should_queue() {
            if let Err(e) = reconciler.mirror_delete(&session, &spec, id) {
                warn!("Local delete of {}/{} failed: {}", spec.local_key, id, e);
            }
            self.queue.enqueue(
                &session,
                spec.remote_name,
                QueuedWrite::Delete {
                    doc_id: id.to_string(),
                },
            )?;
            return Ok(WriteOutcome::Queued);
        }

        reconciler.delete(&session, &spec, id).await?;
        Ok(WriteOutcome::Committed)
    }

    /// Records of a tracked collection
    ///
    /// Reads remotely when possible; falls back to the cache on remote
    /// failure, and serves the cache alone before readiness.
    pub async fn load_records(&self, collection: &str) -> SyncResult<Vec<Value>> {
        let spec = self.spec(collection)?;

        match self.reconciler() {
            Ok(reconciler) => {
                let session = self.session().ok_or(SyncError::NoSession)?;
                reconciler.load(&session, &spec).await
            }
            Err(_) => {
                let session = self.known_session().ok_or(SyncError::NoSession)?;
                Ok(SessionScope::new(&self.kv, &session)
                    .get_json::<Vec<Value>>(spec.local_key)?
                    .unwrap_or_default())
            }
        }
    }

    /// One record of a tracked collection, with the same fallbacks as
    /// `load_records`
    pub async fn load_record(&self, collection: &str, id: &str) -> SyncResult<Option<Value>> {
        let spec = self.spec(collection)?;

        match self.reconciler() {
            Ok(reconciler) => {
                let session = self.session().ok_or(SyncError::NoSession)?;
                reconciler.load_one(&session, &spec, id).await
            }
            Err(_) => {
                let session = self.known_session().ok_or(SyncError::NoSession)?;
                Ok(SessionScope::new(&self.kv, &session)
                    .get_json::<Vec<Value>>(spec.local_key)?
                    .unwrap_or_default()
                    .into_iter()
                    .find(|r| r.get("id").and_then(Value::as_str) == Some(id)))
            }
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        if let Some(task) = locked(&self.lifecycle_task).take() {
            task.abort();
        }
        for task in locked(&self.session_work).drain(..) {
            task.abort();
        }
    }
}

fn upsert(doc: &RemoteDocument) -> QueuedWrite {
    QueuedWrite::Upsert {
        doc_id: doc.id.clone(),
        data: doc.data.clone(),
    }
}

/// Follows auth and connectivity until shutdown or the manager is dropped
async fn run_lifecycle(
    manager: Weak<SyncManager>,
    mut auth_rx: watch::Receiver<Option<UserSession>>,
    mut online_rx: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
) {
    let mut connectivity_open = true;

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            changed = auth_rx.changed() => {
                if changed.is_err() {
                    debug!("Auth provider went away; lifecycle loop stopping");
                    break;
                }
                let next = auth_rx.borrow_and_update().clone();
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_auth_change(next).await;
            }
            changed = online_rx.changed(), if connectivity_open => {
                if changed.is_err() {
                    connectivity_open = false;
                    continue;
                }
                let online = *online_rx.borrow_and_update();
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_connectivity_change(online).await;
            }
        }
    }
}

/// Remote work on behalf of one session
struct SessionWork {
    session: UserSession,
    reconciler: Arc<Reconciler>,
    queue: OfflineQueue,
    events: EventSink,
    queue_enabled: bool,
}

impl SessionWork {
    /// Push freshly seeded records; transient failures go to the queue
    async fn push_seeds(&self, seeds: Vec<(CollectionSpec, RemoteDocument)>) {
        for (spec, doc) in seeds {
            let Err(e) = self.reconciler.push_upsert(&self.session, &spec, &doc).await else {
                continue;
            };
            warn!("Default record for '{}' not pushed: {}", spec.remote_name, e);

            if e.is_transient() && self.queue_enabled {
                if let Err(e) = self.queue.enqueue(&self.session, spec.remote_name, upsert(&doc)) {
                    warn!("Default record for '{}' not queued: {}", spec.remote_name, e);
                }
            } else {
                self.events.emit(SyncEvent::Error(e.to_string()));
            }
        }
    }

    /// Send queued offline writes
    async fn replay(&self) {
        match self.queue.is_empty(&self.session) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!("Offline queue unreadable: {}", e);
                return;
            }
        }

        match self
            .queue
            .replay(&self.session, self.reconciler.remote().as_ref())
            .await
        {
            Ok(ReplayReport {
                applied,
                remaining,
                rejected,
                error,
            }) => {
                info!(
                    "Replayed {} queued writes ({} rejected, {} remaining)",
                    applied,
                    rejected.len(),
                    remaining
                );
                for (entry, e) in &rejected {
                    self.events.emit(SyncEvent::Error(format!(
                        "Queued write to {}/{} rejected: {}",
                        entry.collection,
                        entry.write.doc_id(),
                        e
                    )));
                }
                if let Some(e) = error {
                    self.events.emit(SyncEvent::Error(e.to_string()));
                }
                self.events.emit(SyncEvent::QueueReplayed {
                    applied,
                    rejected: rejected.len(),
                    remaining,
                });
            }
            Err(e) => warn!("Offline queue replay failed: {}", e),
        }
    }
}

/// What a listener task needs to apply snapshots
struct ListenerContext {
    session: UserSession,
    spec: CollectionSpec,
    reconciler: Arc<Reconciler>,
    current: watch::Receiver<Option<UserSession>>,
    events: EventSink,
}

impl ListenerContext {
    fn is_current(&self) -> bool {
        self.current
            .borrow()
            .as_ref()
            .is_some_and(|s| s.uid == self.session.uid)
    }
}

/// Apply every snapshot delivered for one collection
async fn deliver_snapshots(
    context: ListenerContext,
    mut snapshots: mpsc::UnboundedReceiver<Snapshot>,
) {
    while let Some(snapshot) = snapshots.recv().await {
        if !context.is_current() {
            debug!(
                "Dropping '{}' snapshot for ended session {}",
                context.spec.remote_name, context.session.uid
            );
            continue;
        }

        match context
            .reconciler
            .apply_snapshot(&context.session, &context.spec, &snapshot)
        {
            Ok(documents) => {
                context.events.emit(SyncEvent::SnapshotApplied {
                    collection: context.spec.remote_name.to_string(),
                    documents,
                });
            }
            Err(e) => {
                warn!(
                    "Failed to apply '{}' snapshot: {}",
                    context.spec.remote_name, e
                );
                context.events.emit(SyncEvent::Error(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::memory::{MemoryAuth, MemoryConnectivity, MemoryRemote};
    use crate::remote::RemoteStore;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::time::Duration;

    struct Harness {
        manager: Arc<SyncManager>,
        auth: Arc<MemoryAuth>,
        remote: Arc<MemoryRemote>,
        net: Arc<MemoryConnectivity>,
        events: mpsc::UnboundedReceiver<SyncEvent>,
    }

    fn harness_with(config: Config) -> Harness {
        let auth = Arc::new(MemoryAuth::new());
        let remote = Arc::new(MemoryRemote::new());
        let net = Arc::new(MemoryConnectivity::new(true));
        let deps = Arc::new(Dependencies::resolved(
            auth.clone(),
            remote.clone(),
            remote.clone(),
        ));
        let manager = SyncManager::new(
            config,
            KvStore::open_in_memory().unwrap(),
            deps,
            net.clone(),
        );
        let events = manager.take_events().unwrap();
        Harness {
            manager,
            auth,
            remote,
            net,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SyncEvent>,
        mut predicate: impl FnMut(&SyncEvent) -> bool,
    ) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn sign_in(h: &mut Harness, uid: &str) {
        h.auth.sign_in(UserSession::new(uid));
        let uid = uid.to_string();
        wait_for(&mut h.events, |e| *e == SyncEvent::SessionStarted(uid.clone())).await;
    }

    /// Sign in a fresh user and wait until the default institution is
    /// stored remotely and mirrored back
    async fn sign_in_seeded(h: &mut Harness, uid: &str) {
        h.auth.sign_in(UserSession::new(uid));
        let uid = uid.to_string();
        let (mut started, mut seeded) = (false, false);
        wait_for(&mut h.events, |e| {
            match e {
                SyncEvent::SessionStarted(u) if *u == uid => started = true,
                SyncEvent::SnapshotApplied {
                    collection,
                    documents: 1,
                } if collection == "institutions" => seeded = true,
                _ => {}
            }
            started && seeded
        })
        .await;
    }

    #[tokio::test]
    async fn test_initialize_becomes_ready() {
        let mut h = harness();
        assert_eq!(h.manager.lifecycle_state(), LifecycleState::Uninitialized);

        h.manager.initialize().await.unwrap();

        assert!(h.manager.is_ready());
        assert_eq!(h.manager.status(), SyncStatus::Disconnected);
        assert_eq!(h.events.recv().await, Some(SyncEvent::Ready));

        // Second call is a no-op
        h.manager.initialize().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_times_out_permanently() {
        let deps = Arc::new(Dependencies::new());
        let manager = SyncManager::new(
            Config::default(),
            KvStore::open_in_memory().unwrap(),
            deps.clone(),
            Arc::new(MemoryConnectivity::default()),
        );
        let mut events = manager.take_events().unwrap();

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, SyncError::InitializationTimeout { waited_ms: 2_000 }));
        assert_eq!(manager.lifecycle_state(), LifecycleState::Failed);
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::InitializationFailed(_))
        ));

        // Dependencies turning up later changes nothing
        let remote = Arc::new(MemoryRemote::new());
        deps.provide_auth(Arc::new(MemoryAuth::new()));
        deps.provide_remote(remote.clone());
        deps.provide_bridge(remote);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(matches!(manager.initialize().await, Err(SyncError::NotReady)));
        assert!(!manager.sync_status().is_ready);
        assert_eq!(manager.lifecycle_state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_register_listener_before_ready_fails() {
        let h = harness();
        let err = h.manager.register_listener(&INSTITUTIONS).unwrap_err();
        assert!(matches!(err, SyncError::NotReady));
        assert_eq!(h.manager.listeners_active(), 0);
    }

    #[tokio::test]
    async fn test_sign_in_installs_listeners_and_seeds() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in_seeded(&mut h, "u1").await;

        assert_eq!(h.manager.status(), SyncStatus::Connected);
        assert_eq!(
            h.manager.listened_collections(),
            vec!["activities", "attendance", "institutions", "students"]
        );
        for spec in DEFAULT_COLLECTIONS {
            assert_eq!(h.remote.subscriber_count(&format!("users/u1/{}", spec.remote_name)), 1);
        }

        // Default institution exists locally and remotely
        let remote_docs = h.remote.documents("users/u1/institutions");
        assert_eq!(remote_docs.len(), 1);
        let cached: Vec<Value> =
            serde_json::from_str(&h.manager.kv().get("u1_establishments").unwrap().unwrap())
                .unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0]["id"], json!(remote_docs[0].id));
        assert_eq!(
            h.manager.kv().get("u1_defaultEstablishmentCreated").unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_reseeding_never_happens_after_deleting_everything() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in_seeded(&mut h, "u1").await;

        let seeded = h.remote.documents("users/u1/institutions");
        h.manager
            .delete_record("institutions", &seeded[0].id)
            .await
            .unwrap();
        h.auth.sign_out();
        wait_for(&mut h.events, |e| matches!(e, SyncEvent::SessionEnded(_))).await;

        sign_in(&mut h, "u1").await;

        assert!(h.remote.documents("users/u1/institutions").is_empty());
        assert!(!h
            .manager
            .load_records("institutions")
            .await
            .unwrap()
            .iter()
            .any(|r| r["isDefault"] == json!(true)));
    }

    #[tokio::test]
    async fn test_snapshot_replaces_local_collection() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in_seeded(&mut h, "u1").await;

        h.manager
            .kv()
            .set("u1_establishments", r#"[{"id":"local-only"}]"#)
            .unwrap();

        let docs: Vec<RemoteDocument> = ["i1", "i2", "i3"]
            .iter()
            .map(|id| RemoteDocument::from_record(json!({"id": id, "name": id})).unwrap())
            .collect();
        h.remote.replace_collection("users/u1/institutions", docs);

        wait_for(&mut h.events, |e| {
            *e == SyncEvent::SnapshotApplied {
                collection: "institutions".into(),
                documents: 3,
            }
        })
        .await;

        let cached: Vec<Value> =
            serde_json::from_str(&h.manager.kv().get("u1_establishments").unwrap().unwrap())
                .unwrap();
        let ids: Vec<&str> = cached.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["i1", "i2", "i3"]);
    }

    #[tokio::test]
    async fn test_switching_users_tears_down_before_setup() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in(&mut h, "alice").await;

        h.auth.sign_in(UserSession::new("bob"));

        let ended = wait_for(&mut h.events, |e| {
            matches!(e, SyncEvent::SessionEnded(_) | SyncEvent::SessionStarted(_))
        })
        .await;
        assert_eq!(ended, SyncEvent::SessionEnded("alice".into()));
        wait_for(&mut h.events, |e| *e == SyncEvent::SessionStarted("bob".into())).await;

        assert_eq!(h.remote.subscriber_count("users/alice/students"), 0);
        assert_eq!(h.remote.subscriber_count("users/bob/students"), 1);
        assert_eq!(h.manager.listeners_active(), 4);
        assert_eq!(h.manager.session().unwrap().uid, "bob");
    }

    #[tokio::test]
    async fn test_stop_sync_twice_is_harmless() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in(&mut h, "u1").await;
        assert_eq!(h.manager.listeners_active(), 4);

        h.manager.stop_sync();
        assert_eq!(h.manager.listeners_active(), 0);
        h.manager.stop_sync();
        assert_eq!(h.manager.listeners_active(), 0);
        assert_eq!(h.remote.subscriber_count("users/u1/institutions"), 0);
    }

    #[tokio::test]
    async fn test_connectivity_flips_status_only() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in(&mut h, "u1").await;

        h.net.set_online(false);
        wait_for(&mut h.events, |e| {
            *e == SyncEvent::StatusChanged(SyncStatus::Offline)
        })
        .await;
        assert_eq!(h.manager.listeners_active(), 4);
        assert!(!h.manager.sync_status().online);

        h.net.set_online(true);
        wait_for(&mut h.events, |e| {
            *e == SyncEvent::StatusChanged(SyncStatus::Connected)
        })
        .await;
        assert_eq!(h.manager.listeners_active(), 4);
    }

    #[tokio::test]
    async fn test_offline_writes_are_queued_and_replayed() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in_seeded(&mut h, "u1").await;

        h.manager.handle_connectivity_change(false).await;
        let outcome = h
            .manager
            .save_record("students", json!({"id": "s1", "name": "Ada"}))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert!(h.remote.documents("users/u1/students").is_empty());
        assert_eq!(
            h.manager.offline_queue().len(&UserSession::new("u1")).unwrap(),
            1
        );

        let cached = h.manager.local().get("students").unwrap();
        assert!(cached.contains("Ada"));

        h.manager.handle_connectivity_change(true).await;
        wait_for(&mut h.events, |e| {
            *e == SyncEvent::QueueReplayed {
                applied: 1,
                rejected: 0,
                remaining: 0,
            }
        })
        .await;
        assert_eq!(h.remote.documents("users/u1/students").len(), 1);
        assert!(h
            .manager
            .offline_queue()
            .is_empty(&UserSession::new("u1"))
            .unwrap());
    }

    #[tokio::test]
    async fn test_rejected_queued_write_is_reported_and_dropped() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in_seeded(&mut h, "u1").await;

        h.manager.handle_connectivity_change(false).await;
        h.manager
            .save_record("students", json!({"id": "locked", "name": "Ada"}))
            .await
            .unwrap();
        h.manager
            .save_record("students", json!({"id": "s2", "name": "Bo"}))
            .await
            .unwrap();
        h.remote.reject_document(
            "users/u1/students",
            "locked",
            Some(RemoteError::PermissionDenied {
                path: "users/u1/students/locked".into(),
            }),
        );

        h.manager.handle_connectivity_change(true).await;
        let mut rejection_reported = false;
        wait_for(&mut h.events, |e| {
            if matches!(e, SyncEvent::Error(msg) if msg.contains("locked")) {
                rejection_reported = true;
            }
            matches!(e, SyncEvent::QueueReplayed { .. })
        })
        .await;

        assert!(rejection_reported);
        assert!(h
            .manager
            .offline_queue()
            .is_empty(&UserSession::new("u1"))
            .unwrap());
        let ids: Vec<String> = h
            .remote
            .documents("users/u1/students")
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["s2"]);
    }

    #[tokio::test]
    async fn test_offline_queue_disabled_attempts_remote() {
        let config = Config {
            offline_queue_enabled: false,
            ..Config::default()
        };
        let mut h = harness_with(config);
        h.manager.initialize().await.unwrap();
        sign_in(&mut h, "u1").await;

        h.manager.handle_connectivity_change(false).await;
        let outcome = h
            .manager
            .save_record("students", json!({"id": "s1"}))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Committed);
    }

    #[tokio::test]
    async fn test_online_write_failure_is_returned() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in_seeded(&mut h, "u1").await;

        h.remote
            .fail_writes(Some(RemoteError::Unavailable("server down".into())));
        let err = h
            .manager
            .save_institution(&Institution::new("Annex"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));

        // Local mirror stays until the next snapshot
        let cached = h.manager.local().get("establishments").unwrap();
        assert!(cached.contains("Annex"));
        assert!(h.manager.offline_queue().is_empty(&UserSession::new("u1")).unwrap());
    }

    #[tokio::test]
    async fn test_collection_ops_validate_input() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();

        let err = h
            .manager
            .save_record("students", json!({"id": "s1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoSession));

        sign_in_seeded(&mut h, "u1").await;
        let err = h
            .manager
            .save_record("grades", json!({"id": "g1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownCollection(_)));

        let err = h
            .manager
            .save_record("students", json!({"name": "no id"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRecord(_)));

        // Local key works as an alias of the remote name
        h.manager
            .save_record("establishments", json!({"id": "i9", "name": "Alias"}))
            .await
            .unwrap();
        assert_eq!(
            h.manager.load_records("institutions").await.unwrap().len(),
            2
        );
        assert_eq!(
            h.manager.load_record("institutions", "i9").await.unwrap(),
            Some(json!({"id": "i9", "name": "Alias"}))
        );
    }

    #[tokio::test]
    async fn test_unusable_uid_is_refused() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();

        h.auth.sign_in(UserSession::new("a_b"));
        let event = wait_for(&mut h.events, |e| matches!(e, SyncEvent::Error(_))).await;
        assert!(matches!(event, SyncEvent::Error(msg) if msg.contains("a_b")));

        assert!(h.manager.session().is_none());
        assert_eq!(h.manager.listeners_active(), 0);
        h.manager.local().set("notes", "x");
        assert!(h.manager.kv().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_snapshots_for_ended_session_are_dropped() {
        let mut h = harness();
        h.manager.initialize().await.unwrap();
        sign_in(&mut h, "u1").await;

        // Keep a raw subscription open the way a slow listener would
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ListenerContext {
            session: UserSession::new("u1"),
            spec: INSTITUTIONS,
            reconciler: h.manager.reconciler().unwrap().clone(),
            current: h.manager.session.subscribe(),
            events: h.manager.events.clone(),
        };

        h.auth.sign_out();
        wait_for(&mut h.events, |e| matches!(e, SyncEvent::SessionEnded(_))).await;
        let before = h.manager.kv().get("u1_establishments").unwrap();

        tx.send(vec![RemoteDocument::from_record(json!({"id": "late"})).unwrap()])
            .unwrap();
        drop(tx);
        deliver_snapshots(context, rx).await;

        assert_eq!(h.manager.kv().get("u1_establishments").unwrap(), before);
    }

    #[tokio::test]
    async fn test_events_are_not_buffered_until_taken() {
        let auth = Arc::new(MemoryAuth::new());
        let remote = Arc::new(MemoryRemote::new());
        let manager = SyncManager::new(
            Config::default(),
            KvStore::open_in_memory().unwrap(),
            Arc::new(Dependencies::resolved(auth, remote.clone(), remote)),
            Arc::new(MemoryConnectivity::default()),
        );
        manager.initialize().await.unwrap();

        // Plenty of activity with nobody listening
        manager
            .handle_auth_change(Some(UserSession::new("u1")))
            .await;
        for i in 0..200 {
            manager
                .save_record("students", json!({"id": format!("s{}", i)}))
                .await
                .unwrap();
        }
        assert!(!manager.events.is_attached());

        let mut events = manager.take_events().unwrap();
        assert!(manager.take_events().is_none());

        // Only events from after the receiver was taken arrive
        manager.handle_connectivity_change(false).await;
        let first = wait_for(&mut events, |e| matches!(e, SyncEvent::StatusChanged(_))).await;
        assert_eq!(first, SyncEvent::StatusChanged(SyncStatus::Offline));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SyncEvent::Ready | SyncEvent::SessionStarted(_)));
        }
    }

    /// Remote whose writes never complete
    struct HangingRemote(MemoryRemote);

    #[async_trait]
    impl RemoteStore for HangingRemote {
        async fn list_documents(&self, path: &str) -> Result<Vec<RemoteDocument>, RemoteError> {
            self.0.list_documents(path).await
        }

        async fn get_document(
            &self,
            path: &str,
            id: &str,
        ) -> Result<Option<RemoteDocument>, RemoteError> {
            self.0.get_document(path, id).await
        }

        async fn set_document(
            &self,
            _path: &str,
            _id: &str,
            _data: Map<String, Value>,
            _merge: bool,
        ) -> Result<(), RemoteError> {
            std::future::pending().await
        }

        async fn delete_document(&self, _path: &str, _id: &str) -> Result<(), RemoteError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_sign_out_is_not_blocked_by_a_hung_remote() {
        let auth = Arc::new(MemoryAuth::new());
        let bridge = Arc::new(MemoryRemote::new());
        let remote = Arc::new(HangingRemote(bridge.as_ref().clone()));
        let manager = SyncManager::new(
            Config::default(),
            KvStore::open_in_memory().unwrap(),
            Arc::new(Dependencies::resolved(auth.clone(), remote, bridge.clone())),
            Arc::new(MemoryConnectivity::default()),
        );
        let mut events = manager.take_events().unwrap();
        manager.initialize().await.unwrap();

        // The default institution push never returns
        auth.sign_in(UserSession::new("alice"));
        wait_for(&mut events, |e| *e == SyncEvent::SessionStarted("alice".into())).await;
        manager.local().set("notes", "alice secret");

        auth.sign_out();
        wait_for(&mut events, |e| *e == SyncEvent::SessionEnded("alice".into())).await;

        assert!(manager.session().is_none());
        assert_eq!(manager.local().get("notes"), None);
        assert_eq!(manager.listeners_active(), 0);
        assert_eq!(bridge.subscriber_count("users/alice/institutions"), 0);

        // And the next user still gets a full setup
        auth.sign_in(UserSession::new("bob"));
        wait_for(&mut events, |e| *e == SyncEvent::SessionStarted("bob".into())).await;
        assert_eq!(manager.listeners_active(), 4);
    }
}
