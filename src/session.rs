//! Session retrieval with capped exponential backoff and a short-lived cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::LocalStore;

/// Meta key the last good session is cached under.
pub const SESSION_CACHE_KEY: &str = "auth_session";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub user_id: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
  /// Short, log-safe identifier for the access token.
  pub fn fingerprint(&self) -> String {
    let digest = Sha256::digest(self.access_token.as_bytes());
    hex::encode(&digest[..6])
  }

  /// Whether the access token has passed its expiry. Sessions without an
  /// expiry never expire.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }
}

/// The last session written by [`SessionGuard`], unless its token expired.
pub async fn stored_session<S: LocalStore>(store: &S) -> Option<Session> {
  match store.get_meta::<Session>(SESSION_CACHE_KEY).await {
    Ok(Some(record)) if !record.value.is_expired(Utc::now()) => Some(record.value),
    Ok(Some(_)) => {
      debug!("stored session expired");
      None
    }
    Ok(None) => None,
    Err(e) => {
      warn!(error = %e, "failed to read stored session");
      None
    }
  }
}

/// Where fresh sessions come from.
pub trait SessionSource: Send + Sync + 'static {
  fn fetch_session(&self) -> impl Future<Output = Result<Session>> + Send;
}

/// A session plus whether it came from the local cache.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
  pub session: Session,
  pub from_cache: bool,
}

/// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `cap`.
pub fn retry_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
  let exp = attempt.saturating_sub(1).min(16);
  base.saturating_mul(1 << exp).min(cap)
}

pub struct SessionGuard<S: LocalStore, P: SessionSource> {
  store: Arc<S>,
  source: P,
  max_attempts: u32,
  base_delay: Duration,
  max_delay: Duration,
  cache_ttl: chrono::Duration,
}

impl<S: LocalStore, P: SessionSource> SessionGuard<S, P> {
  pub fn new(store: Arc<S>, source: P) -> Self {
    Self {
      store,
      source,
      max_attempts: 3,
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(8),
      cache_ttl: chrono::Duration::minutes(5),
    }
  }

  pub fn with_max_attempts(mut self, attempts: u32) -> Self {
    self.max_attempts = attempts.max(1);
    self
  }

  /// Fetch a session, retrying with backoff, and fall back to a cached one
  /// younger than the cache TTL when every attempt fails.
  pub async fn get_session(&self) -> Result<SessionOutcome> {
    let mut last_error = None;

    for attempt in 1..=self.max_attempts {
      match self.source.fetch_session().await {
        Ok(session) => {
          info!(attempt, token = %session.fingerprint(), "session acquired");
          if let Err(e) = self.store.set_meta(SESSION_CACHE_KEY, &session).await {
            warn!(error = %e, "failed to cache session");
          }
          return Ok(SessionOutcome {
            session,
            from_cache: false,
          });
        }
        Err(e) => {
          warn!(attempt, max = self.max_attempts, error = %e, "session fetch failed");
          last_error = Some(e);
          if attempt < self.max_attempts {
            let delay = retry_delay(self.base_delay, attempt, self.max_delay);
            debug!(?delay, "retrying session fetch");
            tokio::time::sleep(delay).await;
          }
        }
      }
    }

    match self.store.get_meta::<Session>(SESSION_CACHE_KEY).await {
      Ok(Some(record)) if Utc::now() - record.stored_at < self.cache_ttl => {
        info!(token = %record.value.fingerprint(), "using cached session");
        return Ok(SessionOutcome {
          session: record.value,
          from_cache: true,
        });
      }
      Ok(_) => debug!("no usable cached session"),
      Err(e) => warn!(error = %e, "failed to read cached session"),
    }

    Err(last_error.unwrap_or_else(|| eyre!("no session attempts were made")))
  }
}
