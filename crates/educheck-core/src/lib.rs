//! EduCheck Core Library
//!
//! The sync core of EduCheck Pro, an attendance and activity tracker for
//! small educational groups. It keeps a per-user local cache in step with a
//! remote document store.
//!
//! # Architecture
//!
//! - **Local cache**: SQLite key/value table, keys namespaced as `{uid}_{key}`
//! - **Remote store**: source of truth, reached through the traits in `remote`
//! - **Snapshots**: every remote change replaces the cached collection
//!
//! The remote store, auth provider and snapshot bridge are supplied by the
//! host application, possibly after construction. Sync waits for them once
//! and, if they never arrive, the core keeps serving local data.
//!
//! # Quick Start
//!
//! ```text
//! let deps = Arc::new(Dependencies::new());
//! let core = EduCheck::open(Config::load()?, deps.clone(), connectivity)?;
//! core.start();
//!
//! deps.provide_auth(auth);
//! deps.provide_remote(store);
//! deps.provide_bridge(bridge);
//!
//! core.set_user_data("theme", "dark");
//! core.save_record("students", json!({"id": "s1", "name": "Ada"})).await?;
//! ```
//!
//! # Modules
//!
//! - `facade`: public entry point (`EduCheck`)
//! - `sync`: lifecycle, listeners, reconciliation and the offline queue
//! - `storage`: SQLite cache and the user-scoped adapter
//! - `remote`: collaborator traits
//! - `memory`: in-memory collaborators
//! - `models`: documents, institutions and tracked collections
//! - `config`: configuration

pub mod config;
pub mod error;
pub mod facade;
pub mod logging;
pub mod memory;
pub mod models;
pub mod remote;
pub mod session;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use error::{RemoteError, SyncError, SyncResult};
pub use facade::EduCheck;
pub use memory::{MemoryAuth, MemoryConnectivity, MemoryRemote};
pub use models::{CollectionSpec, Institution, RemoteDocument, Snapshot, DEFAULT_COLLECTIONS};
pub use remote::{AuthProvider, ConnectivitySource, RemoteStore, SnapshotBridge, Subscription};
pub use session::UserSession;
pub use storage::{KvStore, StorageError, UserScopedStore};
pub use sync::{
    Dependencies, LifecycleState, SyncEvent, SyncManager, SyncStatus, SyncStatusReport,
    WriteOutcome,
};
