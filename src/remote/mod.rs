//! Access to the managed backend's RPC and auth endpoints.

mod client;

pub use client::{RefreshTokenSource, RemoteClient};
