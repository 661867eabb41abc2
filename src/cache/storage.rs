//! Local store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use super::error::StorageError;
use super::traits::Cacheable;

/// A single cached value for one logical query.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord<T> {
  pub key: String,
  pub value: T,
  /// When the value was written
  pub stored_at: DateTime<Utc>,
}

/// Persistent, asynchronous key-value store used purely as a cache.
///
/// Two independent namespaces live side by side: `meta` values keyed by
/// string, and named collections of entities keyed by their natural id.
/// There is no multi-key atomicity; concurrent writers are last-write-wins.
pub trait LocalStore: Send + Sync + 'static {
  /// Point lookup in the meta namespace.
  fn get_meta<T: DeserializeOwned + Send>(
    &self,
    key: &str,
  ) -> impl Future<Output = Result<Option<CacheRecord<T>>, StorageError>> + Send;

  /// Upsert into the meta namespace, overwriting any prior value.
  fn set_meta<T: Serialize + Sync>(
    &self,
    key: &str,
    value: &T,
  ) -> impl Future<Output = Result<(), StorageError>> + Send;

  /// All entities of a collection; empty when the collection is unknown.
  fn get_all<T: DeserializeOwned + Send>(
    &self,
    collection: &str,
  ) -> impl Future<Output = Result<Vec<T>, StorageError>> + Send;

  /// Overwrite-or-insert each item by its natural id and record `owner` as
  /// the cache key that last wrote the collection.
  fn bulk_put<T: Cacheable>(
    &self,
    collection: &str,
    owner: &str,
    items: &[T],
  ) -> impl Future<Output = Result<(), StorageError>> + Send;

  /// Cache key that last bulk-put into `collection`.
  fn collection_owner(
    &self,
    collection: &str,
  ) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl LocalStore for NoopStorage {
  async fn get_meta<T: DeserializeOwned + Send>(
    &self,
    _key: &str,
  ) -> Result<Option<CacheRecord<T>>, StorageError> {
    Ok(None) // Always miss
  }

  async fn set_meta<T: Serialize + Sync>(&self, _key: &str, _value: &T) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  async fn get_all<T: DeserializeOwned + Send>(
    &self,
    _collection: &str,
  ) -> Result<Vec<T>, StorageError> {
    Ok(Vec::new())
  }

  async fn bulk_put<T: Cacheable>(
    &self,
    _collection: &str,
    _owner: &str,
    _items: &[T],
  ) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  async fn collection_owner(&self, _collection: &str) -> Result<Option<String>, StorageError> {
    Ok(None)
  }
}

/// SQLite-based local store.
///
/// Queries run on the blocking pool so callers on the async runtime never
/// stall on disk I/O.
#[derive(Clone)]
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open (or create) the store at the default location.
  pub fn open_default() -> Result<Self, StorageError> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::Open(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| StorageError::Open(format!("{}: {}", path.display(), e)))?;
    Self::from_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StorageError> {
    let conn =
      Connection::open_in_memory().map_err(|e| StorageError::Open(format!("in-memory: {}", e)))?;
    Self::from_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Open("could not determine data directory".to_string()))?;

    Ok(data_dir.join("lpgcache").join("cache.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self, StorageError> {
    // Another process may hold the write lock; wait instead of failing.
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(CACHE_SCHEMA)?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<R, F>(&self, f: F) -> Result<R, StorageError>
  where
    R: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn
        .lock()
        .map_err(|e| StorageError::Lock(e.to_string()))?;
      f(&mut conn)
    })
    .await
    .map_err(|e| StorageError::Task(e.to_string()))?
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Single-key values, one per logical query
CREATE TABLE IF NOT EXISTS meta_cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    stored_at TEXT NOT NULL
);

-- Bulk entities grouped by collection
CREATE TABLE IF NOT EXISTS collection_items (
    collection TEXT NOT NULL,
    item_id TEXT NOT NULL,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (collection, item_id)
);

-- Which cache key last wrote each collection
CREATE TABLE IF NOT EXISTS collection_owners (
    collection TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    stored_at TEXT NOT NULL
);
"#;

impl LocalStore for SqliteStorage {
  async fn get_meta<T: DeserializeOwned + Send>(
    &self,
    key: &str,
  ) -> Result<Option<CacheRecord<T>>, StorageError> {
    let lookup = key.to_string();
    let row: Option<(Vec<u8>, String)> = self
      .with_conn(move |conn| {
        let row = conn
          .query_row(
            "SELECT value, stored_at FROM meta_cache WHERE key = ?",
            params![lookup],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()?;
        Ok(row)
      })
      .await?;

    match row {
      Some((data, stored_at)) => Ok(Some(CacheRecord {
        key: key.to_string(),
        value: serde_json::from_slice(&data)?,
        stored_at: parse_timestamp(&stored_at)?,
      })),
      None => Ok(None),
    }
  }

  async fn set_meta<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StorageError> {
    let data = serde_json::to_vec(value)?;
    let key = key.to_string();
    let stored_at = now_timestamp();

    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO meta_cache (key, value, stored_at) VALUES (?, ?, ?)",
          params![key, data, stored_at],
        )?;
        Ok(())
      })
      .await
  }

  async fn get_all<T: DeserializeOwned + Send>(
    &self,
    collection: &str,
  ) -> Result<Vec<T>, StorageError> {
    let name = collection.to_string();
    let rows: Vec<rusqlite::Result<Vec<u8>>> = self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT data FROM collection_items WHERE collection = ? ORDER BY item_id",
        )?;
        let rows: Vec<rusqlite::Result<Vec<u8>>> =
          stmt.query_map(params![name], |row| row.get(0))?.collect();
        Ok(rows)
      })
      .await?;

    // Unreadable rows and rows written under an older shape are skipped
    // rather than failing the whole read
    let items: Vec<T> = rows
      .into_iter()
      .filter_map(|row| match row {
        Ok(data) => match serde_json::from_slice(&data) {
          Ok(item) => Some(item),
          Err(e) => {
            warn!(collection, error = %e, "skipping collection row with unexpected shape");
            None
          }
        },
        Err(e) => {
          warn!(collection, error = %e, "skipping unreadable collection row");
          None
        }
      })
      .collect();
    Ok(items)
  }

  async fn bulk_put<T: Cacheable>(
    &self,
    collection: &str,
    owner: &str,
    items: &[T],
  ) -> Result<(), StorageError> {
    let rows = items
      .iter()
      .map(|item| -> Result<_, StorageError> { Ok((item.cache_key(), serde_json::to_vec(item)?)) })
      .collect::<Result<Vec<_>, _>>()?;
    let collection = collection.to_string();
    let owner = owner.to_string();
    let stored_at = now_timestamp();

    self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        for (item_id, data) in &rows {
          tx.execute(
            "INSERT OR REPLACE INTO collection_items (collection, item_id, data, stored_at)
             VALUES (?, ?, ?, ?)",
            params![collection, item_id, data, stored_at],
          )?;
        }
        tx.execute(
          "INSERT OR REPLACE INTO collection_owners (collection, cache_key, stored_at)
           VALUES (?, ?, ?)",
          params![collection, owner, stored_at],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await
  }

  async fn collection_owner(&self, collection: &str) -> Result<Option<String>, StorageError> {
    let collection = collection.to_string();
    self
      .with_conn(move |conn| {
        let owner = conn
          .query_row(
            "SELECT cache_key FROM collection_owners WHERE collection = ?",
            params![collection],
            |row| row.get(0),
          )
          .optional()?;
        Ok(owner)
      })
      .await
  }
}

fn now_timestamp() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored RFC 3339 timestamp.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| StorageError::Timestamp(s.to_string()))
}
