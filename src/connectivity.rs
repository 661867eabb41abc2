//! Online/offline signal shared by every consumer.
//!
//! `Connectivity` is a cheap, cloneable handle around a watch channel.
//! Consumers read the current value with [`Connectivity::is_online`] or take a
//! receiver with [`Connectivity::subscribe`]; dropping the receiver is the
//! unsubscribe. No debounce is applied here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a platform online/offline event.
  ///
  /// Subscribers are only notified on an actual transition.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if changed {
      info!(online, "connectivity changed");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Something that can tell whether the remote service is reachable.
pub trait Probe: Send + Sync + 'static {
  fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

/// Periodically probe reachability and feed the result into `connectivity`.
pub fn spawn_probe<P: Probe>(
  connectivity: Connectivity,
  probe: P,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let reachable = probe.is_reachable().await;
      debug!(reachable, "connectivity probe");
      connectivity.set_online(reachable);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct FlagProbe(Arc<AtomicBool>);

  impl Probe for FlagProbe {
    async fn is_reachable(&self) -> bool {
      self.0.load(Ordering::SeqCst)
    }
  }

  #[test]
  fn test_set_online_flips_value() {
    let connectivity = Connectivity::new(true);
    connectivity.set_online(false);
    assert!(!connectivity.is_online());

    let clone = connectivity.clone();
    clone.set_online(true);
    assert!(connectivity.is_online());
  }

  #[tokio::test]
  async fn test_subscribers_see_transitions_only() {
    let connectivity = Connectivity::new(true);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(true);
    assert!(!rx.has_changed().unwrap());

    connectivity.set_online(false);
    assert!(rx.has_changed().unwrap());
    assert!(!*rx.borrow_and_update());
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_drives_connectivity() {
    let reachable = Arc::new(AtomicBool::new(false));
    let connectivity = Connectivity::new(true);
    let mut rx = connectivity.subscribe();

    let handle = spawn_probe(
      connectivity.clone(),
      FlagProbe(reachable.clone()),
      Duration::from_secs(10),
    );

    rx.changed().await.unwrap();
    assert!(!connectivity.is_online());

    reachable.store(true, Ordering::SeqCst);
    rx.changed().await.unwrap();
    assert!(connectivity.is_online());

    handle.abort();
  }
}
