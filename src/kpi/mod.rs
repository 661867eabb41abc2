//! Dashboard KPI loading.
//!
//! The aggregator assembles one dashboard snapshot from four remote
//! aggregate calls, paints from cache first, and debounces refetch bursts.

mod aggregator;
mod snapshot;

pub use aggregator::{KpiAggregator, KpiView, DASHBOARD_KPI_KEY};

use color_eyre::Result;
use serde_json::Value;
use std::future::Future;

/// The four remote aggregates behind the dashboard.
///
/// Results are raw JSON; coercion into numbers happens in the snapshot so a
/// source never has to decide what a missing value means.
pub trait KpiSource: Send + Sync + 'static {
  fn today_sales_total(&self) -> impl Future<Output = Result<Value>> + Send;
  fn today_expenses_total(&self) -> impl Future<Output = Result<Value>> + Send;
  fn inventory_totals(&self) -> impl Future<Output = Result<Value>> + Send;
  fn active_orders_count(&self) -> impl Future<Output = Result<Value>> + Send;
}
