//! Async query orchestration on top of the cache layer.
//!
//! A `Query<T>` owns a fetcher closure, runs it on the runtime, retries a
//! failed fetch a small fixed number of times, and tracks staleness. While
//! the connectivity handle reports offline, data is never stale, so callers
//! polling `is_stale()` do not spin on a network they cannot reach.
//!
//! # Example
//!
//! ```ignore
//! let layer = layer.clone();
//! let mut query = Query::new(move || {
//!     let layer = layer.clone();
//!     async move {
//!         layer
//!             .fetch(FetchRequest::new("stock"), || remote.rpc("get_stock", &params))
//!             .await
//!             .map_err(|e| e.to_string())
//!     }
//! })
//! .with_connectivity(connectivity.clone());
//!
//! query.fetch();
//! match query.settle().await {
//!     QueryState::Success(data) => render(data),
//!     QueryState::Error(e) => render_error(e),
//!     _ => {}
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connectivity::Connectivity;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a Result<T, String>
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = std::sync::Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Default number of extra attempts after a failed fetch
const DEFAULT_RETRY: u32 = 1;

/// Async query for data fetching with state management.
pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, String>>>,
  fetched_at: Option<Instant>,
  stale_time: Duration,
  retry: u32,
  connectivity: Option<Connectivity>,
}

impl<T: Send + 'static> Query<T> {
  /// Create a new query with the given fetcher function.
  ///
  /// The fetcher is called once per attempt, so it must be `Fn`.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: std::sync::Arc::new(move || Box::pin(fetcher())),
      receiver: None,
      fetched_at: None,
      stale_time: Duration::ZERO,
      retry: DEFAULT_RETRY,
      connectivity: None,
    }
  }

  /// Set the stale time for this query.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  /// Number of extra attempts after a failure (0 disables retry).
  pub fn with_retry(mut self, retry: u32) -> Self {
    self.retry = retry;
    self
  }

  /// Suspend staleness while `connectivity` reports offline.
  pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  /// Get the current state of the query.
  #[cfg(test)]
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the data if the query succeeded.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Check if the data is stale (older than stale_time).
  ///
  /// Always false while offline.
  pub fn is_stale(&self) -> bool {
    if let Some(connectivity) = &self.connectivity {
      if !connectivity.is_online() {
        return false;
      }
    }

    match &self.state {
      QueryState::Success(_) => self
        .fetched_at
        .map(|t| t.elapsed() >= self.stale_time)
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching data if not already loading.
  ///
  /// This is a no-op if the query is already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, even if already loading or data exists.
  pub fn refetch(&mut self) {
    // Cancel any pending fetch by dropping the receiver
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.apply(result);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.apply(Err("Query was cancelled".to_string()));
        true
      }
    }
  }

  /// Wait for a pending fetch to finish and return the resulting state.
  pub async fn settle(&mut self) -> &QueryState<T> {
    if let Some(receiver) = &mut self.receiver {
      let result = receiver
        .recv()
        .await
        .unwrap_or_else(|| Err("Query was cancelled".to_string()));
      self.apply(result);
    }
    &self.state
  }

  fn apply(&mut self, result: Result<T, String>) {
    match result {
      Ok(data) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(Instant::now());
      }
      Err(error) => {
        self.state = QueryState::Error(error);
      }
    }
    self.receiver = None;
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let fetcher = std::sync::Arc::clone(&self.fetcher);
    let attempts = self.retry + 1;
    tokio::spawn(async move {
      let mut result = fetcher().await;
      let mut attempt = 1;
      while result.is_err() && attempt < attempts {
        attempt += 1;
        debug!(attempt, "retrying query");
        result = fetcher().await;
      }
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .field("retry", &self.retry)
      .finish_non_exhaustive()
  }
}
