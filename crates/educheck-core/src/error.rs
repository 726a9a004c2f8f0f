//! Sync error handling
//!
//! `RemoteError` is what document-store collaborators report.
//! `SyncError` is what the sync core hands back to its callers.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors reported by a remote document store or snapshot bridge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The store could not be reached (offline, DNS, timeout)
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// The signed-in user may not touch this path
    #[error("Permission denied for '{path}'")]
    PermissionDenied { path: String },

    /// Document or collection does not exist
    #[error("Not found: '{path}'")]
    NotFound { path: String },

    /// Anything else the store reports
    #[error("Remote store error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Whether retrying later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// Errors returned by sync core operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Dependencies have not resolved yet, or never will
    #[error("Sync core is not ready")]
    NotReady,

    /// Auth, remote store and snapshot bridge did not all appear in time
    #[error("Sync dependencies not available after {waited_ms}ms")]
    InitializationTimeout { waited_ms: u64 },

    /// Operation needs a signed-in user
    #[error("No active user session")]
    NoSession,

    /// The auth provider reported a uid that cannot namespace keys
    #[error("Invalid session uid '{uid}'")]
    InvalidSession { uid: String },

    /// Collection is not one the core tracks
    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),

    /// A record could not be turned into a remote document
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Remote write or read rejected
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local cache failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// JSON encoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
