//! Cache-first dashboard KPI aggregator.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::snapshot::DashboardKpiSnapshot;
use super::KpiSource;
use crate::cache::LocalStore;
use crate::clock::{Clock, SystemClock};
use crate::connectivity::Connectivity;

/// Meta key the snapshot is cached under.
pub const DASHBOARD_KPI_KEY: &str = "dashboard_kpis";

/// What the dashboard should currently show.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KpiView {
  pub snapshot: Option<DashboardKpiSnapshot>,
  /// True until the first successful network load replaces the cached copy
  pub is_from_cache: bool,
  /// Last load problem; the snapshot is kept when this is set
  pub warning: Option<String>,
}

/// Debounce and reentrancy state of the load routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Idle,
  Fetching { started_at: DateTime<Utc> },
  Cooldown { until: DateTime<Utc> },
}

#[derive(Debug)]
struct Debounce {
  phase: Phase,
  window: Duration,
}

impl Debounce {
  fn new(window: Duration) -> Self {
    Self {
      phase: Phase::Idle,
      window,
    }
  }

  /// Current phase, with an expired cooldown resolved to `Idle`.
  fn phase(&mut self, now: DateTime<Utc>) -> Phase {
    if let Phase::Cooldown { until } = self.phase {
      if now >= until {
        self.phase = Phase::Idle;
      }
    }
    self.phase
  }

  /// Enter `Fetching` if allowed; false while fetching or cooling down.
  fn try_begin(&mut self, now: DateTime<Utc>) -> bool {
    match self.phase(now) {
      Phase::Idle => {
        self.phase = Phase::Fetching { started_at: now };
        true
      }
      Phase::Fetching { .. } | Phase::Cooldown { .. } => false,
    }
  }

  /// Leave `Fetching`; the cooldown window counts from when the fetch started.
  fn finish(&mut self) {
    if let Phase::Fetching { started_at } = self.phase {
      self.phase = Phase::Cooldown {
        until: started_at + self.window,
      };
    }
  }
}

struct State {
  view: KpiView,
  debounce: Debounce,
  cache_checked: bool,
}

/// Produces the dashboard snapshot from cache and the four remote aggregates.
///
/// Errors never clear what is already shown: the previous snapshot stays and
/// a warning is attached instead.
pub struct KpiAggregator<S: LocalStore, K: KpiSource, C: Clock = SystemClock> {
  store: Arc<S>,
  source: K,
  connectivity: Connectivity,
  clock: C,
  key: String,
  ttl: Duration,
  state: Mutex<State>,
}

impl<S: LocalStore, K: KpiSource> KpiAggregator<S, K> {
  pub fn new(store: Arc<S>, source: K, connectivity: Connectivity) -> Self {
    Self {
      store,
      source,
      connectivity,
      clock: SystemClock,
      key: DASHBOARD_KPI_KEY.to_string(),
      ttl: Duration::minutes(5),
      state: Mutex::new(State {
        view: KpiView::default(),
        debounce: Debounce::new(Duration::milliseconds(2000)),
        cache_checked: false,
      }),
    }
  }
}

impl<S: LocalStore, K: KpiSource, C: Clock> KpiAggregator<S, K, C> {
  pub fn with_clock<C2: Clock>(self, clock: C2) -> KpiAggregator<S, K, C2> {
    KpiAggregator {
      store: self.store,
      source: self.source,
      connectivity: self.connectivity,
      clock,
      key: self.key,
      ttl: self.ttl,
      state: self.state,
    }
  }

  /// How long a cached snapshot counts as fresh.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Minimum spacing between two network loads.
  pub fn with_debounce(mut self, window: Duration) -> Self {
    self
      .state
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .debounce
      .window = window;
    self
  }

  /// Cache key override, e.g. one per business.
  pub fn with_key(mut self, key: impl Into<String>) -> Self {
    self.key = key.into();
    self
  }

  pub fn view(&self) -> KpiView {
    self.lock_state().view.clone()
  }

  /// Whether `snapshot` is younger than the TTL.
  pub fn is_fresh(&self, snapshot: &DashboardKpiSnapshot) -> bool {
    self.clock.now() - snapshot.timestamp() < self.ttl
  }

  /// Load the dashboard: cached copy first, then the network when online.
  ///
  /// A call while another load is running, or within the debounce window of
  /// the previous one, returns the current view without a network round-trip.
  pub async fn load(&self) -> KpiView {
    self.paint_from_cache().await;

    if !self.connectivity.is_online() {
      let view = self.view();
      match &view.snapshot {
        Some(snapshot) => {
          debug!(fresh = self.is_fresh(snapshot), "offline, serving cached dashboard");
        }
        None => {
          warn!("offline with no cached dashboard");
          let mut state = self.lock_state();
          state.view.warning = Some("offline and no cached dashboard data".to_string());
          return state.view.clone();
        }
      }
      return view;
    }

    let now = self.clock.now();
    if !self.lock_state().debounce.try_begin(now) {
      debug!("dashboard load skipped, fetch in flight or too recent");
      return self.view();
    }
    // Leaves `Fetching` on every exit, including when this future is dropped
    let _fetching = FetchingGuard { state: &self.state };

    let result = tokio::try_join!(
      self.source.today_sales_total(),
      self.source.today_expenses_total(),
      self.source.inventory_totals(),
      self.source.active_orders_count(),
    );

    match result {
      Ok((sales, expenses, inventory, orders)) => {
        let snapshot = DashboardKpiSnapshot::from_aggregates(
          &sales,
          &expenses,
          &inventory,
          &orders,
          self.clock.now(),
        );
        if let Err(e) = self.store.set_meta(&self.key, &snapshot).await {
          warn!(key = %self.key, error = %e, "failed to cache dashboard snapshot");
        }
        info!(
          sales = snapshot.today_sales(),
          profit = snapshot.today_profit(),
          "dashboard refreshed"
        );

        let mut state = self.lock_state();
        state.view = KpiView {
          snapshot: Some(snapshot),
          is_from_cache: false,
          warning: None,
        };
        state.view.clone()
      }
      Err(e) => {
        warn!(error = %e, "dashboard refresh failed, keeping current data");
        let mut state = self.lock_state();
        state.view.warning = Some(e.to_string());
        state.view.clone()
      }
    }
  }

  /// Reload whenever connectivity goes from offline to online.
  pub fn spawn_reconnect_refresh(self: &Arc<Self>) -> JoinHandle<()> {
    let aggregator = Arc::clone(self);
    let mut rx = self.connectivity.subscribe();
    let mut was_online = *rx.borrow_and_update();

    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if online && !was_online {
          info!("back online, refreshing dashboard");
          aggregator.load().await;
        }
        was_online = online;
      }
    })
  }

  /// Show the cached snapshot before any network activity, once.
  async fn paint_from_cache(&self) {
    {
      let mut state = self.lock_state();
      if state.cache_checked {
        return;
      }
      state.cache_checked = true;
    }

    let cached = match self.store.get_meta::<DashboardKpiSnapshot>(&self.key).await {
      Ok(cached) => cached,
      Err(e) => {
        warn!(key = %self.key, error = %e, "failed to read cached dashboard");
        None
      }
    };

    if let Some(record) = cached {
      let mut state = self.lock_state();
      // A network load that finished meanwhile wins over the cache
      if state.view.snapshot.is_none() {
        state.view.snapshot = Some(record.value);
        state.view.is_from_cache = true;
      }
    }
  }

  fn lock_state(&self) -> MutexGuard<'_, State> {
    lock(&self.state)
  }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves the debounce from `Fetching` into cooldown when dropped.
struct FetchingGuard<'a> {
  state: &'a Mutex<State>,
}

impl Drop for FetchingGuard<'_> {
  fn drop(&mut self) {
    lock(self.state).debounce.finish();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::clock::ManualClock;
  use crate::kpi::snapshot::{ActiveOrders, InventoryTotals};
  use color_eyre::eyre::eyre;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

  /// Every aggregate waits `delay_ms` before answering.
  #[derive(Clone, Default)]
  struct FakeSource {
    calls: Arc<AtomicU32>,
    fail: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
  }

  impl FakeSource {
    fn with_delay(ms: u64) -> Self {
      let source = Self::default();
      source.delay_ms.store(ms, Ordering::SeqCst);
      source
    }

    fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) {
      let ms = self.delay_ms.load(Ordering::SeqCst);
      if ms > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
      }
    }
  }

  impl KpiSource for FakeSource {
    async fn today_sales_total(&self) -> color_eyre::Result<Value> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.respond().await;
      if self.fail.load(Ordering::SeqCst) {
        return Err(eyre!("rpc timed out"));
      }
      Ok(json!("1500.5"))
    }

    async fn today_expenses_total(&self) -> color_eyre::Result<Value> {
      self.respond().await;
      Ok(json!(300))
    }

    async fn inventory_totals(&self) -> color_eyre::Result<Value> {
      self.respond().await;
      Ok(json!([{
        "total_full": "12",
        "total_empty": null,
        "total_package": 4,
        "total_refill": "9",
        "total_problem": 1
      }]))
    }

    async fn active_orders_count(&self) -> color_eyre::Result<Value> {
      self.respond().await;
      Ok(json!([{"pending_count": 2, "dispatched_count": "3", "total_active": 5}]))
    }
  }

  fn start() -> DateTime<Utc> {
    "2026-10-17T08:00:00Z".parse().unwrap()
  }

  fn aggregator(
    online: bool,
    source: FakeSource,
  ) -> (
    KpiAggregator<SqliteStorage, FakeSource, ManualClock>,
    Arc<SqliteStorage>,
    ManualClock,
  ) {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let clock = ManualClock::new(start());
    let aggregator =
      KpiAggregator::new(Arc::clone(&store), source, Connectivity::new(online)).with_clock(clock.clone());
    (aggregator, store, clock)
  }

  fn cached_snapshot(timestamp: DateTime<Utc>) -> DashboardKpiSnapshot {
    DashboardKpiSnapshot::new(
      100.0,
      25.0,
      InventoryTotals::default(),
      ActiveOrders::default(),
      timestamp,
    )
  }

  #[test]
  fn test_debounce_phases() {
    let mut debounce = Debounce::new(Duration::milliseconds(2000));
    let t0 = start();

    assert_eq!(debounce.phase(t0), Phase::Idle);
    assert!(debounce.try_begin(t0));
    assert_eq!(debounce.phase(t0), Phase::Fetching { started_at: t0 });

    // Reentrant call while fetching
    assert!(!debounce.try_begin(t0 + Duration::seconds(10)));

    debounce.finish();
    let until = t0 + Duration::milliseconds(2000);
    assert_eq!(debounce.phase(t0), Phase::Cooldown { until });
    assert!(!debounce.try_begin(t0 + Duration::milliseconds(1999)));
    assert_eq!(debounce.phase(until), Phase::Idle);
    assert!(debounce.try_begin(until));
  }

  #[tokio::test]
  async fn test_online_load_builds_and_caches_snapshot() {
    let source = FakeSource::default();
    let (aggregator, store, _clock) = aggregator(true, source.clone());

    let view = aggregator.load().await;
    let snapshot = view.snapshot.unwrap();

    assert!(!view.is_from_cache);
    assert!(view.warning.is_none());
    assert_eq!(snapshot.today_sales(), 1500.5);
    assert_eq!(snapshot.today_expenses(), 300.0);
    assert_eq!(snapshot.today_profit(), 1200.5);
    assert_eq!(snapshot.inventory().total_full, 12.0);
    assert_eq!(snapshot.inventory().total_empty, 0.0);
    assert_eq!(snapshot.active_orders().dispatched_count, 3.0);
    assert_eq!(snapshot.timestamp(), start());

    let cached = store
      .get_meta::<DashboardKpiSnapshot>(DASHBOARD_KPI_KEY)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(cached.value, snapshot);
    assert_eq!(source.calls(), 1);
  }

  #[tokio::test]
  async fn test_offline_serves_cache_without_network() {
    let source = FakeSource::default();
    let (aggregator, store, _clock) = aggregator(false, source.clone());
    let cached = cached_snapshot(start() - Duration::minutes(1));
    store.set_meta(DASHBOARD_KPI_KEY, &cached).await.unwrap();

    let view = aggregator.load().await;

    assert_eq!(view.snapshot.as_ref(), Some(&cached));
    assert!(view.is_from_cache);
    assert!(aggregator.is_fresh(&cached));
    assert_eq!(source.calls(), 0);
  }

  #[tokio::test]
  async fn test_offline_without_cache_warns() {
    let (aggregator, _store, _clock) = aggregator(false, FakeSource::default());

    let view = aggregator.load().await;

    assert!(view.snapshot.is_none());
    assert!(view.warning.is_some());
  }

  #[tokio::test]
  async fn test_loads_within_debounce_window_hit_network_once() {
    let source = FakeSource::default();
    let (aggregator, _store, clock) = aggregator(true, source.clone());

    aggregator.load().await;
    clock.advance(Duration::milliseconds(1500));
    aggregator.load().await;
    assert_eq!(source.calls(), 1);

    clock.advance(Duration::milliseconds(500));
    aggregator.load().await;
    assert_eq!(source.calls(), 2);
  }

  #[tokio::test]
  async fn test_overlapping_loads_are_not_queued() {
    let source = FakeSource::with_delay(50);
    let (aggregator, _store, _clock) = aggregator(true, source.clone());

    let (first, second) = tokio::join!(aggregator.load(), aggregator.load());

    assert_eq!(source.calls(), 1);
    // The skipped call returns whatever was shown at the time, which is nothing yet
    let loaded = [&first, &second]
      .iter()
      .filter(|view| view.snapshot.is_some())
      .count();
    assert_eq!(loaded, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_aggregates_are_requested_concurrently() {
    let source = FakeSource::with_delay(100);
    let (aggregator, _store, _clock) = aggregator(true, source.clone());

    let started = tokio::time::Instant::now();
    let view = aggregator.load().await;

    assert!(view.snapshot.is_some());
    // Four sequential calls would take 400ms
    assert!(started.elapsed() < std::time::Duration::from_millis(400));
  }

  #[tokio::test]
  async fn test_cancelled_load_does_not_block_later_loads() {
    let source = FakeSource::with_delay(60_000);
    let (aggregator, _store, clock) = aggregator(true, source.clone());

    let timed_out =
      tokio::time::timeout(std::time::Duration::from_millis(50), aggregator.load()).await;
    assert!(timed_out.is_err());
    assert_eq!(source.calls(), 1);
    assert!(!matches!(
      aggregator.lock_state().debounce.phase(clock.now()),
      Phase::Fetching { .. }
    ));

    source.delay_ms.store(0, Ordering::SeqCst);
    clock.advance(Duration::hours(1));
    let view = aggregator.load().await;

    assert_eq!(source.calls(), 2);
    assert!(view.snapshot.is_some());
  }

  #[tokio::test]
  async fn test_error_keeps_cached_snapshot() {
    let source = FakeSource::default();
    source.fail.store(true, Ordering::SeqCst);
    let (aggregator, store, _clock) = aggregator(true, source.clone());
    let cached = cached_snapshot(start() - Duration::hours(3));
    store.set_meta(DASHBOARD_KPI_KEY, &cached).await.unwrap();

    let view = aggregator.load().await;

    assert_eq!(view.snapshot.as_ref(), Some(&cached));
    assert!(view.is_from_cache);
    assert!(!aggregator.is_fresh(&cached));
    assert_eq!(view.warning.as_deref(), Some("rpc timed out"));
  }

  #[tokio::test]
  async fn test_error_after_success_keeps_previous_value() {
    let source = FakeSource::default();
    let (aggregator, _store, clock) = aggregator(true, source.clone());

    let first = aggregator.load().await;
    source.fail.store(true, Ordering::SeqCst);
    clock.advance(Duration::seconds(5));
    let second = aggregator.load().await;

    assert_eq!(second.snapshot, first.snapshot);
    assert!(!second.is_from_cache);
    assert!(second.warning.is_some());
  }

  #[tokio::test]
  async fn test_reconnect_triggers_refresh() {
    let source = FakeSource::default();
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let connectivity = Connectivity::new(false);
    let aggregator = Arc::new(
      KpiAggregator::new(store, source.clone(), connectivity.clone())
        .with_clock(ManualClock::new(start())),
    );
    let handle = aggregator.spawn_reconnect_refresh();

    connectivity.set_online(true);
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
      while aggregator.view().snapshot.is_none() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      }
    })
    .await
    .unwrap();
    assert_eq!(source.calls(), 1);

    // Going offline does not trigger a load
    connectivity.set_online(false);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(source.calls(), 1);

    handle.abort();
  }
}
