//! Offline-aware caching for remote query results.
//!
//! This module provides:
//! - A persistent local store with a `meta` namespace (one value per cache
//!   key) and named collections of entities keyed by natural id
//! - A fetch wrapper that serves from the store while offline, writes through
//!   on every successful network read, and falls back to the store when the
//!   network fails
//! - Typed storage errors that the wrapper logs and swallows

mod error;
mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, FetchRequest};
pub use storage::{LocalStore, NoopStorage, SqliteStorage};
pub use traits::CacheResult;
