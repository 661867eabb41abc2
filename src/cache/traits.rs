//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

/// Trait for entities that can be mirrored into a collection.
///
/// Implementors provide the natural id used to overwrite-or-insert the entity
/// during a bulk put.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Natural identifier for this entity (e.g. cylinder id, order id)
  fn cache_key(&self) -> String;
}

impl Cacheable for serde_json::Value {
  /// Uses the `id` field when present, otherwise a digest of the whole item
  /// so identical rows still collapse onto one entry.
  fn cache_key(&self) -> String {
    match self.get("id") {
      Some(serde_json::Value::String(id)) => id.clone(),
      Some(serde_json::Value::Number(id)) => id.to_string(),
      _ => {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        hex::encode(hasher.finalize())
      }
    }
  }
}

/// A fetch result whose entities can be mirrored into a collection.
///
/// Only array-shaped results carry entities; anything else is cached as a
/// single meta value and leaves the collection alone.
pub trait Listing: Serialize + DeserializeOwned + Send + Sync {
  type Item: Cacheable;

  /// The entities, when the result is array-shaped.
  fn items(&self) -> Option<&[Self::Item]>;

  /// Rebuild a result from the entities of a collection.
  fn from_items(items: Vec<Self::Item>) -> Self;
}

impl<T: Cacheable> Listing for Vec<T> {
  type Item = T;

  fn items(&self) -> Option<&[T]> {
    Some(self)
  }

  fn from_items(items: Vec<T>) -> Self {
    items
  }
}

impl Listing for serde_json::Value {
  type Item = serde_json::Value;

  fn items(&self) -> Option<&[serde_json::Value]> {
    self.as_array().map(Vec::as_slice)
  }

  fn from_items(items: Vec<serde_json::Value>) -> Self {
    serde_json::Value::Array(items)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the remote service.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached data still inside the caller's stale time.
  pub fn fresh(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Cached data served because we are offline.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  /// Cached data served because the remote call failed.
  pub fn fallback(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at,
    }
  }

  /// Caller-supplied placeholder used when nothing was cached.
  pub fn placeholder(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Placeholder,
      cached_at: None,
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source.is_from_cache()
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, younger than the requested stale time
  CacheFresh,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Online but the remote call failed, serving cached data
  Fallback,
  /// Nothing cached; the caller's fallback value was returned
  Placeholder,
}

impl CacheSource {
  pub fn is_from_cache(self) -> bool {
    !matches!(self, CacheSource::Network)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::Offline => "offline",
      CacheSource::Fallback => "fallback",
      CacheSource::Placeholder => "placeholder",
    }
  }
}
