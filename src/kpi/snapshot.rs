//! Dashboard KPI snapshot and lenient number coercion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cylinder stock totals across the business.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryTotals {
  pub total_full: f64,
  pub total_empty: f64,
  pub total_package: f64,
  pub total_refill: f64,
  pub total_problem: f64,
}

impl InventoryTotals {
  /// Build from an aggregate RPC row, coercing every field.
  pub fn from_row(row: &Value) -> Self {
    let row = first_row(row);
    Self {
      total_full: coerce_number(row.get("total_full")),
      total_empty: coerce_number(row.get("total_empty")),
      total_package: coerce_number(row.get("total_package")),
      total_refill: coerce_number(row.get("total_refill")),
      total_problem: coerce_number(row.get("total_problem")),
    }
  }
}

/// Counts of orders that are not yet closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveOrders {
  pub pending_count: f64,
  pub dispatched_count: f64,
  pub total_active: f64,
}

impl ActiveOrders {
  pub fn from_row(row: &Value) -> Self {
    let row = first_row(row);
    Self {
      pending_count: coerce_number(row.get("pending_count")),
      dispatched_count: coerce_number(row.get("dispatched_count")),
      total_active: coerce_number(row.get("total_active")),
    }
  }
}

/// One composite dashboard summary.
///
/// `today_profit` is always `today_sales - today_expenses`: it is computed on
/// construction and recomputed when read back from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SnapshotRecord", into = "SnapshotRecord")]
pub struct DashboardKpiSnapshot {
  today_sales: f64,
  today_expenses: f64,
  today_profit: f64,
  inventory: InventoryTotals,
  active_orders: ActiveOrders,
  timestamp: DateTime<Utc>,
}

impl DashboardKpiSnapshot {
  pub fn new(
    today_sales: f64,
    today_expenses: f64,
    inventory: InventoryTotals,
    active_orders: ActiveOrders,
    timestamp: DateTime<Utc>,
  ) -> Self {
    let today_sales = finite_or_zero(today_sales);
    let today_expenses = finite_or_zero(today_expenses);
    Self {
      today_sales,
      today_expenses,
      today_profit: today_sales - today_expenses,
      inventory,
      active_orders,
      timestamp,
    }
  }

  /// Assemble from the four raw aggregate results.
  pub fn from_aggregates(
    sales: &Value,
    expenses: &Value,
    inventory: &Value,
    active_orders: &Value,
    timestamp: DateTime<Utc>,
  ) -> Self {
    Self::new(
      coerce_number(Some(sales)),
      coerce_number(Some(expenses)),
      InventoryTotals::from_row(inventory),
      ActiveOrders::from_row(active_orders),
      timestamp,
    )
  }

  pub fn today_sales(&self) -> f64 {
    self.today_sales
  }

  pub fn today_expenses(&self) -> f64 {
    self.today_expenses
  }

  pub fn today_profit(&self) -> f64 {
    self.today_profit
  }

  pub fn inventory(&self) -> &InventoryTotals {
    &self.inventory
  }

  pub fn active_orders(&self) -> &ActiveOrders {
    &self.active_orders
  }

  pub fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }
}

/// Stored shape of a snapshot.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRecord {
  #[serde(default)]
  today_sales: Value,
  #[serde(default)]
  today_expenses: Value,
  #[serde(default)]
  today_profit: Value,
  #[serde(default)]
  inventory: Value,
  #[serde(default)]
  active_orders: Value,
  timestamp: DateTime<Utc>,
}

impl From<SnapshotRecord> for DashboardKpiSnapshot {
  fn from(record: SnapshotRecord) -> Self {
    DashboardKpiSnapshot::from_aggregates(
      &record.today_sales,
      &record.today_expenses,
      &record.inventory,
      &record.active_orders,
      record.timestamp,
    )
  }
}

impl From<DashboardKpiSnapshot> for SnapshotRecord {
  fn from(snapshot: DashboardKpiSnapshot) -> Self {
    SnapshotRecord {
      today_sales: number_value(snapshot.today_sales),
      today_expenses: number_value(snapshot.today_expenses),
      today_profit: number_value(snapshot.today_profit),
      inventory: serde_json::to_value(snapshot.inventory).unwrap_or(Value::Null),
      active_orders: serde_json::to_value(snapshot.active_orders).unwrap_or(Value::Null),
      timestamp: snapshot.timestamp,
    }
  }
}

/// Lenient numeric coercion for aggregate results.
///
/// Numbers pass through, numeric strings are parsed, booleans become 1/0, and
/// anything else (missing, null, NaN, objects, unparseable text) becomes 0.
/// A single-element array is unwrapped first since scalar RPCs sometimes come
/// back as one-row sets.
pub fn coerce_number(value: Option<&Value>) -> f64 {
  let n = match value {
    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
    Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
    Some(Value::Bool(b)) => f64::from(u8::from(*b)),
    Some(Value::Array(items)) if items.len() == 1 => return coerce_number(items.first()),
    _ => 0.0,
  };
  finite_or_zero(n)
}

fn finite_or_zero(n: f64) -> f64 {
  if n.is_finite() {
    n
  } else {
    0.0
  }
}

static NULL: Value = Value::Null;

/// Aggregate functions return either one object or a one-row array.
fn first_row(value: &Value) -> &Value {
  match value {
    Value::Array(rows) => rows.first().unwrap_or(&NULL),
    other => other,
  }
}

fn number_value(n: f64) -> Value {
  serde_json::Number::from_f64(n)
    .map(Value::Number)
    .unwrap_or(Value::Null)
}
