//! User-scoped cache adapter
//!
//! Every key is namespaced `{uid}_{key}` by the active session. With no
//! session, reads return `None` and writes do nothing: callers racing
//! sign-in during startup get a quiet no-op instead of an error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use super::error::{StorageError, StorageResult};
use super::kv::KvStore;
use crate::session::UserSession;

/// The cache as seen by one explicit session
#[derive(Debug, Clone, Copy)]
pub struct SessionScope<'a> {
    kv: &'a KvStore,
    session: &'a UserSession,
}

impl<'a> SessionScope<'a> {
    pub fn new(kv: &'a KvStore, session: &'a UserSession) -> Self {
        Self { kv, session }
    }

    pub fn session(&self) -> &UserSession {
        self.session
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.kv.get(&self.session.scoped_key(key))
    }

    pub fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.kv.set(&self.session.scoped_key(key), value)
    }

    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        self.kv.remove(&self.session.scoped_key(key))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        self.kv.get_json(&self.session.scoped_key(key))
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        self.kv.set_json(&self.session.scoped_key(key), value)
    }
}

/// Cache adapter that follows the current session
#[derive(Debug, Clone)]
pub struct UserScopedStore {
    kv: KvStore,
    session: watch::Receiver<Option<UserSession>>,
}

impl UserScopedStore {
    /// Scope `kv` by whatever session `session` currently holds
    pub fn new(kv: KvStore, session: watch::Receiver<Option<UserSession>>) -> Self {
        Self { kv, session }
    }

    /// The session keys are currently scoped by
    pub fn session(&self) -> Option<UserSession> {
        self.session.borrow().clone()
    }

    /// Underlying unscoped store
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Read `{uid}_{key}`; `None` without a session
    pub fn get(&self, key: &str) -> Option<String> {
        let session = self.session()?;
        get_logged(&self.kv, &session, key)
    }

    /// Write `{uid}_{key}`; no-op without a session
    pub fn set(&self, key: &str, value: &str) {
        if let Some(session) = self.session() {
            set_logged(&self.kv, &session, key, value);
        }
    }

    /// Delete `{uid}_{key}`; no-op without a session
    pub fn remove(&self, key: &str) {
        if let Some(session) = self.session() {
            remove_logged(&self.kv, &session, key);
        }
    }
}

/// Best-effort read for an explicit session, storage errors logged
pub(crate) fn get_logged(kv: &KvStore, session: &UserSession, key: &str) -> Option<String> {
    match SessionScope::new(kv, session).get(key) {
        Ok(value) => value,
        Err(e) => {
            log_failure("read", key, &e);
            None
        }
    }
}

/// Best-effort write for an explicit session, storage errors logged
pub(crate) fn set_logged(kv: &KvStore, session: &UserSession, key: &str, value: &str) {
    if let Err(e) = SessionScope::new(kv, session).set(key, value) {
        log_failure("write", key, &e);
    }
}

/// Best-effort delete for an explicit session, storage errors logged
pub(crate) fn remove_logged(kv: &KvStore, session: &UserSession, key: &str) {
    if let Err(e) = SessionScope::new(kv, session).remove(key) {
        log_failure("delete", key, &e);
    }
}

fn log_failure(action: &str, key: &str, error: &StorageError) {
    match error.recovery_suggestion() {
        Some(hint) => warn!("Cache {} of '{}' failed: {}. {}", action, key, error, hint),
        None => warn!("Cache {} of '{}' failed: {}", action, key, error),
    }
}
