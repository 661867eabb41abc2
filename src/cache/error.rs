//! Error types for the local store and the fetch wrapper.

use thiserror::Error;

/// Failures of the local key-value store.
///
/// The fetch wrapper never lets these reach its caller; they are logged and
/// treated as a cache miss.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("failed to open cache database: {0}")]
  Open(String),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to (de)serialize cached value: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("failed to parse stored timestamp '{0}'")]
  Timestamp(String),

  #[error("lock poisoned: {0}")]
  Lock(String),

  #[error("storage task failed: {0}")]
  Task(String),
}

/// Failures surfaced by the fetch wrapper.
#[derive(Debug, Error)]
pub enum FetchError {
  /// Offline with nothing cached and no fallback value.
  #[error("no cached data available offline for '{key}'")]
  NoCachedData { key: String },

  /// The remote call failed and no cached copy exists.
  #[error("remote fetch failed: {0}")]
  Remote(color_eyre::Report),
}
