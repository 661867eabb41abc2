//! Cache layer that decides per call between the local store and the network.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::FetchError;
use super::storage::{CacheRecord, LocalStore};
use super::traits::{CacheResult, Listing};
use crate::connectivity::Connectivity;

/// Options for one cached fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest<T> {
  key: String,
  collection: Option<String>,
  stale_time: Duration,
  fallback: Option<T>,
}

impl<T> FetchRequest<T> {
  pub fn new(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      collection: None,
      stale_time: Duration::zero(),
      fallback: None,
    }
  }

  /// Mirror array results into this collection and use it as a secondary
  /// fallback. Only [`CacheLayer::fetch_list`] reads this; [`CacheLayer::fetch`]
  /// caches the meta value alone.
  pub fn collection(mut self, name: impl Into<String>) -> Self {
    self.collection = Some(name.into());
    self
  }

  /// Serve cached data younger than this without touching the network.
  /// Zero (the default) always goes to the network when online.
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Value returned when offline with nothing cached.
  pub fn fallback(mut self, data: T) -> Self {
    self.fallback = Some(data);
    self
  }
}

/// Cache-aware fetch wrapper.
///
/// Offline it reads the local store and never calls the fetcher. Online it
/// calls the fetcher, writes the result back, and falls back to the store
/// when the fetcher fails. Store failures are logged and treated as misses.
pub struct CacheLayer<S: LocalStore> {
  storage: Arc<S>,
  connectivity: Connectivity,
}

impl<S: LocalStore> CacheLayer<S> {
  #[cfg(test)]
  pub fn new(storage: S, connectivity: Connectivity) -> Self {
    Self::from_shared(Arc::new(storage), connectivity)
  }

  pub fn from_shared(storage: Arc<S>, connectivity: Connectivity) -> Self {
    Self {
      storage,
      connectivity,
    }
  }

  #[cfg(test)]
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  #[cfg(test)]
  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Fetch a single value.
  pub async fn fetch<T, F, Fut>(
    &self,
    request: FetchRequest<T>,
    fetcher: F,
  ) -> Result<CacheResult<T>, FetchError>
  where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>>,
  {
    let key = request.key.as_str();

    if !self.connectivity.is_online() {
      if let Some(cached) = self.cached::<T>(key).await {
        debug!(key, "offline, serving cached value");
        return Ok(CacheResult::offline(cached.value, Some(cached.stored_at)));
      }
      return offline_miss(request);
    }

    let mut cached = None;
    if request.stale_time > Duration::zero() {
      match self.cached::<T>(key).await {
        Some(record) if is_fresh(record.stored_at, request.stale_time) => {
          debug!(key, "cache fresh, skipping network");
          return Ok(CacheResult::fresh(record.value, record.stored_at));
        }
        other => cached = other,
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.write_meta(key, &data).await;
        Ok(CacheResult::from_network(data))
      }
      Err(e) => {
        warn!(key, error = %e, "remote fetch failed, trying cache");
        let cached = match cached {
          Some(record) => Some(record),
          None => self.cached::<T>(key).await,
        };
        match cached {
          Some(record) => Ok(CacheResult::fallback(record.value, Some(record.stored_at))),
          None => Err(FetchError::Remote(e)),
        }
      }
    }
  }

  /// Fetch a result that may be array-shaped.
  ///
  /// Every network result is written to meta; array-shaped ones are also
  /// mirrored into the request's collection, which then backs the fallback
  /// when meta misses.
  pub async fn fetch_list<L, F, Fut>(
    &self,
    request: FetchRequest<L>,
    fetcher: F,
  ) -> Result<CacheResult<L>, FetchError>
  where
    L: Listing,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<L>>,
  {
    let key = request.key.as_str();
    let collection = request.collection.as_deref();

    if !self.connectivity.is_online() {
      if let Some(cached) = self.cached::<L>(key).await {
        debug!(key, "offline, serving cached list");
        return Ok(CacheResult::offline(cached.value, Some(cached.stored_at)));
      }
      if let Some(items) = self.cached_collection::<L>(key, collection).await {
        debug!(key, ?collection, "offline, serving collection");
        return Ok(CacheResult::offline(items, None));
      }
      return offline_miss(request);
    }

    let mut cached = None;
    if request.stale_time > Duration::zero() {
      match self.cached::<L>(key).await {
        Some(record) if is_fresh(record.stored_at, request.stale_time) => {
          debug!(key, "cache fresh, skipping network");
          return Ok(CacheResult::fresh(record.value, record.stored_at));
        }
        other => cached = other,
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.write_meta(key, &data).await;
        if let (Some(collection), Some(items)) = (collection, data.items()) {
          if let Err(e) = self.storage.bulk_put(collection, key, items).await {
            warn!(key, collection, error = %e, "failed to mirror list into collection");
          }
        }
        Ok(CacheResult::from_network(data))
      }
      Err(e) => {
        warn!(key, error = %e, "remote fetch failed, trying cache");
        let cached = match cached {
          Some(record) => Some(record),
          None => self.cached::<L>(key).await,
        };
        if let Some(record) = cached {
          return Ok(CacheResult::fallback(record.value, Some(record.stored_at)));
        }
        match self.cached_collection::<L>(key, collection).await {
          Some(items) => Ok(CacheResult::fallback(items, None)),
          None => Err(FetchError::Remote(e)),
        }
      }
    }
  }

  /// Meta lookup with storage errors turned into misses.
  async fn cached<T: DeserializeOwned + Send>(&self, key: &str) -> Option<CacheRecord<T>> {
    match self.storage.get_meta::<T>(key).await {
      Ok(record) => record,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Collection lookup, only when the collection was last written by `key`.
  async fn cached_collection<L: Listing>(
    &self,
    key: &str,
    collection: Option<&str>,
  ) -> Option<L> {
    let collection = collection?;

    let owner = match self.storage.collection_owner(collection).await {
      Ok(owner) => owner,
      Err(e) => {
        warn!(collection, error = %e, "collection owner lookup failed");
        return None;
      }
    };
    if owner.as_deref() != Some(key) {
      debug!(key, collection, ?owner, "collection belongs to another query, skipping");
      return None;
    }

    match self.storage.get_all::<L::Item>(collection).await {
      Ok(items) if !items.is_empty() => Some(L::from_items(items)),
      Ok(_) => None,
      Err(e) => {
        warn!(collection, error = %e, "collection read failed");
        None
      }
    }
  }

  async fn write_meta<T: Serialize + Sync>(&self, key: &str, data: &T) {
    if let Err(e) = self.storage.set_meta(key, data).await {
      warn!(key, error = %e, "cache write failed");
    }
  }
}

impl<S: LocalStore> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      connectivity: self.connectivity.clone(),
    }
  }
}

fn offline_miss<T>(request: FetchRequest<T>) -> Result<CacheResult<T>, FetchError> {
  match request.fallback {
    Some(data) => {
      debug!(key = %request.key, "offline with empty cache, using fallback");
      Ok(CacheResult::placeholder(data))
    }
    None => Err(FetchError::NoCachedData { key: request.key }),
  }
}

fn is_fresh(stored_at: DateTime<Utc>, stale_time: Duration) -> bool {
  Utc::now() - stored_at < stale_time
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::error::StorageError;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::traits::{CacheSource, Cacheable};
  use color_eyre::eyre::eyre;
  use serde::Deserialize;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Order {
    id: u32,
    status: String,
  }

  impl Cacheable for Order {
    fn cache_key(&self) -> String {
      self.id.to_string()
    }
  }

  fn orders() -> Vec<Order> {
    vec![
      Order {
        id: 1,
        status: "pending".to_string(),
      },
      Order {
        id: 2,
        status: "dispatched".to_string(),
      },
    ]
  }

  fn layer(online: bool) -> CacheLayer<SqliteStorage> {
    CacheLayer::new(
      SqliteStorage::open_in_memory().unwrap(),
      Connectivity::new(online),
    )
  }

  /// Store whose every operation fails.
  struct BrokenStorage;

  impl LocalStore for BrokenStorage {
    async fn get_meta<T: DeserializeOwned + Send>(
      &self,
      _key: &str,
    ) -> Result<Option<CacheRecord<T>>, StorageError> {
      Err(StorageError::Open("disk gone".to_string()))
    }

    async fn set_meta<T: Serialize + Sync>(
      &self,
      _key: &str,
      _value: &T,
    ) -> Result<(), StorageError> {
      Err(StorageError::Open("disk gone".to_string()))
    }

    async fn get_all<T: DeserializeOwned + Send>(
      &self,
      _collection: &str,
    ) -> Result<Vec<T>, StorageError> {
      Err(StorageError::Open("disk gone".to_string()))
    }

    async fn bulk_put<T: Cacheable>(
      &self,
      _collection: &str,
      _owner: &str,
      _items: &[T],
    ) -> Result<(), StorageError> {
      Err(StorageError::Open("disk gone".to_string()))
    }

    async fn collection_owner(&self, _collection: &str) -> Result<Option<String>, StorageError> {
      Err(StorageError::Open("disk gone".to_string()))
    }
  }

  #[tokio::test]
  async fn test_offline_hit_skips_fetcher() {
    let layer = layer(false);
    layer.storage().set_meta("stock", &json!({"total": 7})).await.unwrap();
    let calls = AtomicU32::new(0);

    let result = layer
      .fetch(FetchRequest::new("stock"), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"total": 99}))
      })
      .await
      .unwrap();

    assert_eq!(result.data, json!({"total": 7}));
    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.cached_at.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_offline_empty_cache_uses_fallback() {
    let layer = layer(false);

    let result = layer
      .fetch(
        FetchRequest::new("counts").fallback(json!({"count": 0})),
        || async { Err(eyre!("should not be called")) },
      )
      .await
      .unwrap();

    assert_eq!(result.data, json!({"count": 0}));
    assert!(result.is_from_cache());
    assert_eq!(result.source, CacheSource::Placeholder);
  }

  #[tokio::test]
  async fn test_offline_empty_cache_without_fallback_errors() {
    let layer = layer(false);

    let result = layer
      .fetch(FetchRequest::<Value>::new("counts"), || async {
        Ok(json!(1))
      })
      .await;

    match result {
      Err(FetchError::NoCachedData { key }) => assert_eq!(key, "counts"),
      other => panic!("expected NoCachedData, got {:?}", other.map(|r| r.data)),
    }
  }

  #[tokio::test]
  async fn test_online_success_writes_cache() {
    let layer = layer(true);

    let result = layer
      .fetch(FetchRequest::new("expenses"), || async { Ok(json!({"total": 15.5})) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert!(!result.is_from_cache());

    let record = layer
      .storage()
      .get_meta::<Value>("expenses")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(record.value, json!({"total": 15.5}));
  }

  #[tokio::test]
  async fn test_online_failure_falls_back_to_cache() {
    let layer = layer(true);
    layer
      .fetch(FetchRequest::new("sales"), || async { Ok(json!({"total": 42})) })
      .await
      .unwrap();

    let result = layer
      .fetch(FetchRequest::<Value>::new("sales"), || async {
        Err(eyre!("connection reset"))
      })
      .await
      .unwrap();

    assert_eq!(result.data, json!({"total": 42}));
    assert_eq!(result.source, CacheSource::Fallback);
  }

  #[tokio::test]
  async fn test_online_failure_without_cache_propagates_original_error() {
    let layer = layer(true);

    let result = layer
      .fetch(
        FetchRequest::new("sales").fallback(json!({"total": 0})),
        || async { Err(eyre!("connection reset")) },
      )
      .await;

    match result {
      Err(FetchError::Remote(e)) => assert_eq!(e.to_string(), "connection reset"),
      other => panic!("expected Remote, got {:?}", other.map(|r| r.data)),
    }
  }

  #[tokio::test]
  async fn test_fresh_cache_within_stale_time_skips_network() {
    let layer = layer(true);
    layer.storage().set_meta("prices", &json!([1, 2])).await.unwrap();
    let calls = AtomicU32::new(0);

    let result = layer
      .fetch(
        FetchRequest::new("prices").stale_time(Duration::minutes(10)),
        || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(json!([3]))
        },
      )
      .await
      .unwrap();

    assert_eq!(result.data, json!([1, 2]));
    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_fetch_list_mirrors_into_collection() {
    let layer = layer(true);

    for _ in 0..2 {
      layer
        .fetch_list(FetchRequest::new("orders:active").collection("orders"), || async {
          Ok(orders())
        })
        .await
        .unwrap();
    }

    let stored: Vec<Order> = layer.storage().get_all("orders").await.unwrap();
    assert_eq!(stored, orders());
  }

  #[tokio::test]
  async fn test_json_object_result_is_cached_but_not_mirrored() {
    let layer = layer(true);

    let result = layer
      .fetch_list(FetchRequest::new("stats").collection("stats_rows"), || async {
        Ok(json!({"total": 1}))
      })
      .await
      .unwrap();
    assert_eq!(result.data, json!({"total": 1}));
    assert_eq!(result.source, CacheSource::Network);

    let record = layer.storage().get_meta::<Value>("stats").await.unwrap().unwrap();
    assert_eq!(record.value, json!({"total": 1}));
    let rows: Vec<Value> = layer.storage().get_all("stats_rows").await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(layer.storage().collection_owner("stats_rows").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_json_array_result_is_mirrored_and_served_offline() {
    let layer = layer(true);
    let rows = json!([{"id": "c-1", "size": 12}, {"id": "c-2", "size": 6}]);
    let expected = rows.clone();

    layer
      .fetch_list(FetchRequest::new("cylinders").collection("cylinders"), || async {
        Ok(rows)
      })
      .await
      .unwrap();

    let stored: Vec<Value> = layer.storage().get_all("cylinders").await.unwrap();
    assert_eq!(Value::Array(stored), expected);

    // A store holding only the mirrored rows answers offline with an array
    let offline = CacheLayer::new(SqliteStorage::open_in_memory().unwrap(), Connectivity::new(false));
    let items = expected.as_array().unwrap().clone();
    offline.storage().bulk_put("cylinders", "cylinders", &items).await.unwrap();

    let result = offline
      .fetch_list(
        FetchRequest::<Value>::new("cylinders").collection("cylinders"),
        || async { Err(eyre!("should not be called")) },
      )
      .await
      .unwrap();
    assert_eq!(result.data, expected);
    assert_eq!(result.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_offline_list_falls_back_to_owned_collection() {
    let layer = layer(false);
    layer
      .storage()
      .bulk_put("orders", "orders:active", &orders())
      .await
      .unwrap();

    let result = layer
      .fetch_list(
        FetchRequest::<Vec<Order>>::new("orders:active").collection("orders"),
        || async { Ok(Vec::new()) },
      )
      .await
      .unwrap();

    assert_eq!(result.data, orders());
    assert_eq!(result.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_collection_owned_by_other_query_is_ignored() {
    let layer = layer(false);
    layer
      .storage()
      .bulk_put("orders", "orders:history", &orders())
      .await
      .unwrap();

    let result = layer
      .fetch_list(
        FetchRequest::<Vec<Order>>::new("orders:active").collection("orders"),
        || async { Ok(Vec::new()) },
      )
      .await;

    assert!(matches!(result, Err(FetchError::NoCachedData { .. })));
  }

  #[tokio::test]
  async fn test_online_list_failure_uses_collection() {
    let layer = layer(true);
    layer
      .storage()
      .bulk_put("orders", "orders:active", &orders())
      .await
      .unwrap();

    let result = layer
      .fetch_list(
        FetchRequest::<Vec<Order>>::new("orders:active").collection("orders"),
        || async { Err(eyre!("503")) },
      )
      .await
      .unwrap();

    assert_eq!(result.data, orders());
    assert_eq!(result.source, CacheSource::Fallback);
  }

  #[tokio::test]
  async fn test_storage_errors_never_reach_caller() {
    let online = CacheLayer::new(BrokenStorage, Connectivity::new(true));
    let result = online
      .fetch_list(FetchRequest::new("orders:active").collection("orders"), || async {
        Ok(orders())
      })
      .await
      .unwrap();
    assert_eq!(result.data, orders());
    assert_eq!(result.source, CacheSource::Network);

    let offline = CacheLayer::new(BrokenStorage, Connectivity::new(false));
    let result = offline
      .fetch(FetchRequest::new("k").fallback(json!({"count": 0})), || async {
        Ok(json!(1))
      })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Placeholder);
  }

  #[tokio::test]
  async fn test_connectivity_is_read_per_call() {
    let layer = layer(true);
    layer
      .fetch(FetchRequest::new("k"), || async { Ok(json!(1)) })
      .await
      .unwrap();

    layer.connectivity().set_online(false);
    let result = layer
      .fetch(FetchRequest::<Value>::new("k"), || async { Ok(json!(2)) })
      .await
      .unwrap();

    assert_eq!(result.data, json!(1));
    assert_eq!(result.source, CacheSource::Offline);
  }
}
