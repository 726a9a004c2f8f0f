//! SQLite-backed key/value cache
//!
//! The persisted store every user-scoped key lands in. It knows nothing
//! about sessions; see `UserScopedStore` for the namespacing adapter.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::schema::{get_schema_version, init_schema, needs_init, SCHEMA_VERSION};
use crate::config::Config;

/// Shared handle to the cache database
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").field("path", &self.path).finish()
    }
}

impl KvStore {
    /// Open the cache at the configured location
    pub fn open(config: &Config) -> StorageResult<Self> {
        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir)
                .map_err(|e| StorageError::from_io(e, config.data_dir.clone()))?;
        }
        Self::open_path(&config.cache_path())
    }

    /// Open (or create) a cache database file
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a throwaway in-memory cache
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        if let Some(found) = get_schema_version(&conn).ok().flatten() {
            if found > SCHEMA_VERSION {
                return Err(StorageError::UnsupportedSchema {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
        }
        if needs_init(&conn) {
            init_schema(&conn)?;
            debug!("Initialized cache schema v{} at {:?}", SCHEMA_VERSION, path);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Location on disk, `None` for in-memory caches
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a raw value
    pub fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Insert or overwrite a raw value
    pub fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Delete a value, returning whether it existed
    pub fn remove(&self, key: &str) -> StorageResult<bool> {
        let removed = self.conn().execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(removed > 0)
    }


    /// Number of entries in the cache
    pub fn len(&self) -> StorageResult<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Read and decode a JSON value
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::CorruptEntry {
                key: key.to_string(),
                details: e.to_string(),
            })
    }

    /// Encode and store a JSON value
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let raw = serde_json::to_string(value).map_err(|e| StorageError::CorruptEntry {
            key: key.to_string(),
            details: e.to_string(),
        })?;
        self.set(key, &raw)
    }
}
