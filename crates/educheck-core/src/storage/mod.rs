//! Storage layer
//!
//! Local persisted cache for the sync core.
//!
//! ## Architecture
//!
//! - **KvStore**: SQLite key/value table shared by every user on the device
//! - **UserScopedStore**: adapter that namespaces keys by the active session
//!
//! Remote snapshots overwrite whole entries; nothing here merges.

pub mod error;
pub mod kv;
pub mod schema;
pub mod scoped;

pub use error::{StorageError, StorageResult};
pub use kv::KvStore;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use scoped::{SessionScope, UserScopedStore};
