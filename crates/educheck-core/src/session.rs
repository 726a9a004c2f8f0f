//! User session identity
//!
//! A session exists between sign-in and sign-out. Every cache key and
//! remote path the sync core touches is derived from its `uid`.
//!
//! Uids must be non-empty and free of `_` and `/`. Keys are `{uid}_{key}`,
//! so a `_` in the uid would let `a` + `b_c` collide with `a_b` + `c`; a `/`
//! would escape `users/{uid}/`. Sessions that break this are refused by the
//! sync manager.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// The signed-in user, as reported by the auth provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSession {
    /// Stable user identifier
    pub uid: String,
    /// Email address, if the provider exposes one
    pub email: Option<String>,
}

impl UserSession {
    /// Create a session for a uid
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
        }
    }

    /// Create a session, refusing uids that cannot namespace keys
    pub fn try_new(uid: impl Into<String>) -> SyncResult<Self> {
        let session = Self::new(uid);
        session.validate()?;
        Ok(session)
    }

    /// Whether the uid can be used to namespace keys and paths
    pub fn is_valid(&self) -> bool {
        !self.uid.is_empty() && !self.uid.contains(['_', '/'])
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SyncError::InvalidSession {
                uid: self.uid.clone(),
            })
        }
    }

    /// Attach an email address
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Namespace a logical cache key: `{uid}_{key}`
    pub fn scoped_key(&self, key: &str) -> String {
        format!("{}_{}", self.uid, key)
    }

    /// Remote path of one of this user's collections
    pub fn collection_path(&self, collection: &str) -> String {
        format!("users/{}/{}", self.uid, collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_key() {
        let session = UserSession::new("abc123");
        assert_eq!(session.scoped_key("students"), "abc123_students");
    }

    #[test]
    fn test_collection_path() {
        let session = UserSession::new("abc123").with_email("teacher@school.test");
        assert_eq!(
            session.collection_path("institutions"),
            "users/abc123/institutions"
        );
        assert_eq!(session.email.as_deref(), Some("teacher@school.test"));
    }

    #[test]
    fn test_different_users_never_share_keys() {
        let a = UserSession::new("alice");
        let b = UserSession::new("bob");
        assert_ne!(a.scoped_key("establishments"), b.scoped_key("establishments"));
    }

    #[test]
    fn test_ambiguous_uids_are_rejected() {
        // "a" + "b_c" and "a_b" + "c" would share a cache key
        assert!(UserSession::try_new("a_b").is_err());
        assert!(UserSession::try_new("").is_err());
        assert!(UserSession::try_new("a/b").is_err());
        assert!(matches!(
            UserSession::new("x_y").validate(),
            Err(SyncError::InvalidSession { uid }) if uid == "x_y"
        ));

        let ok = UserSession::try_new("Xq9fK2LmN0").unwrap();
        assert!(ok.is_valid());
        assert_eq!(ok.scoped_key("b_c"), "Xq9fK2LmN0_b_c");
    }
}
