//! Connectivity state fed by an external adapter.
//!
//! The offline layer does not check the network itself. Whatever knows about
//! connectivity (an OS hook, a health check, a test) calls
//! [`ConnectivityMonitor::set_online`]; interested parties register a handler
//! or hold a `watch` receiver.

use std::sync::Mutex;
use tokio::sync::watch;
use tracing::info;

type Handler = Box<dyn Fn(bool) + Send + Sync>;

/// Handle returned by [`ConnectivityMonitor::on_connectivity_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct ConnectivityMonitor {
  state: watch::Sender<bool>,
  handlers: Mutex<Vec<(SubscriptionId, Handler)>>,
  next_id: Mutex<u64>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    let (state, _) = watch::channel(online);
    Self {
      state,
      handlers: Mutex::new(Vec::new()),
      next_id: Mutex::new(0),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.state.borrow()
  }

  /// Record the current state. Handlers run only on an actual transition.
  pub fn set_online(&self, online: bool) {
    let changed = self.state.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if !changed {
      return;
    }

    info!(online, "Connectivity changed");
    if let Ok(handlers) = self.handlers.lock() {
      for (_, handler) in handlers.iter() {
        handler(online);
      }
    }
  }

  /// Call `handler` with the new state on every transition.
  pub fn on_connectivity_change(
    &self,
    handler: impl Fn(bool) + Send + Sync + 'static,
  ) -> SubscriptionId {
    let id = match self.next_id.lock() {
      Ok(mut next) => {
        *next += 1;
        SubscriptionId(*next)
      }
      Err(_) => SubscriptionId(0),
    };
    if let Ok(mut handlers) = self.handlers.lock() {
      handlers.push((id, Box::new(handler)));
    }
    id
  }

  pub fn unsubscribe(&self, id: SubscriptionId) {
    if let Ok(mut handlers) = self.handlers.lock() {
      handlers.retain(|(existing, _)| *existing != id);
    }
  }

  /// Async view of the state, for background tasks.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn test_handlers_fire_on_transitions_only() {
    let monitor = ConnectivityMonitor::new(true);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    monitor.on_connectivity_change(move |online| sink.lock().unwrap().push(online));

    monitor.set_online(true);
    monitor.set_online(false);
    monitor.set_online(false);
    monitor.set_online(true);

    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    assert!(monitor.is_online());
  }

  #[test]
  fn test_unsubscribe() {
    let monitor = ConnectivityMonitor::new(false);
    let seen = Arc::new(Mutex::new(0));
    let sink = seen.clone();
    let id = monitor.on_connectivity_change(move |_| *sink.lock().unwrap() += 1);

    monitor.set_online(true);
    monitor.unsubscribe(id);
    monitor.set_online(false);

    assert_eq!(*seen.lock().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_watch_receiver_sees_change() {
    let monitor = ConnectivityMonitor::new(false);
    let mut rx = monitor.subscribe();
    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow());
  }
}
