//! Service container for the offline layer.
//!
//! Everything is constructed explicitly and shared through [`Services`].
//! [`OfflineContext::init`] starts the background sync worker and
//! [`OfflineContext::dispose`] stops it once any drain in flight finishes.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::admin::CacheAdmin;
use crate::cache::{FailureSink, LocalCache, SharedCache, TracingSink};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{LocalStore, SqliteStore, UnavailableStore};
use crate::error::{OfflineError, Result};
use crate::facade::OfflineResource;
use crate::invalidation::InvalidationOrchestrator;
use crate::queue::PendingQueue;
use crate::remote::{HttpRemote, RemoteApi};
use crate::resource::ResourceKind;
use crate::sync::{PendingStatus, SyncCoordinator, SyncResult};

/// The wired-up components. Cheap to share behind an `Arc`.
pub struct Services {
  pub store: Arc<dyn LocalStore>,
  pub clock: Arc<dyn Clock>,
  pub sink: Arc<dyn FailureSink>,
  pub local: Arc<LocalCache>,
  pub shared: Arc<SharedCache>,
  pub queue: Arc<PendingQueue>,
  pub remote: Arc<dyn RemoteApi>,
  pub orchestrator: Arc<InvalidationOrchestrator>,
  pub connectivity: Arc<ConnectivityMonitor>,
  pub coordinator: Arc<SyncCoordinator>,
}

impl Services {
  pub fn new(
    config: &Config,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn FailureSink>,
  ) -> Self {
    let local = Arc::new(LocalCache::new(
      store.clone(),
      clock.clone(),
      sink.clone(),
      config.cache.clone(),
    ));
    let shared = Arc::new(SharedCache::new(clock.clone(), config.cache.shared_ttl_secs));
    let queue = Arc::new(PendingQueue::new(
      store.clone(),
      clock.clone(),
      config.sync.max_attempts,
    ));
    let orchestrator = Arc::new(InvalidationOrchestrator::new(
      local.clone(),
      shared.clone(),
      sink.clone(),
    ));
    let coordinator = Arc::new(SyncCoordinator::new(
      queue.clone(),
      store.clone(),
      remote.clone(),
      local.clone(),
      orchestrator.clone(),
      clock.clone(),
      config.sync.lease_ttl_ms,
    ));

    Self {
      store,
      clock,
      sink,
      local,
      shared,
      queue,
      remote,
      orchestrator,
      connectivity: Arc::new(ConnectivityMonitor::default()),
      coordinator,
    }
  }
}

struct Worker {
  handle: JoinHandle<()>,
  shutdown: watch::Sender<bool>,
}

/// Owns the services and the background sync worker.
pub struct OfflineContext {
  services: Arc<Services>,
  sync_interval: Option<Duration>,
  worker: Mutex<Option<Worker>>,
}

impl OfflineContext {
  pub fn new(services: Arc<Services>, sync_interval: Option<Duration>) -> Self {
    Self {
      services,
      sync_interval,
      worker: Mutex::new(None),
    }
  }

  /// Build from configuration: SQLite store, HTTP remote, system clock.
  ///
  /// A store that cannot be opened degrades to online-only operation; the
  /// failure is logged once here rather than on every call.
  pub fn from_config(config: &Config) -> Result<Self> {
    let store = open_store(config);
    let remote = HttpRemote::new(
      &config.api.base_url,
      Duration::from_secs(config.api.timeout_secs),
      Config::get_api_token(),
    )?;
    let services = Services::new(
      config,
      store,
      Arc::new(remote),
      Arc::new(SystemClock),
      Arc::new(TracingSink),
    );
    let interval = (config.sync.interval_secs > 0)
      .then(|| Duration::from_secs(config.sync.interval_secs));
    Ok(Self::new(Arc::new(services), interval))
  }

  pub fn services(&self) -> &Arc<Services> {
    &self.services
  }

  /// Start the background worker: drain on every offline-to-online
  /// transition and on each periodic tick while online. Idempotent.
  pub fn init(&self) -> Result<()> {
    let mut worker = self
      .worker
      .lock()
      .map_err(|e| OfflineError::StorageUnavailable(format!("Lock poisoned: {}", e)))?;
    if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
      return Ok(());
    }

    let services = self.services.clone();
    let mut online = services.connectivity.subscribe();
    let (shutdown, mut stop) = watch::channel(false);
    let mut ticker = self.sync_interval.map(|period| {
      let mut ticker = interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      ticker
    });

    let handle = tokio::spawn(async move {
      // Drains run inside the arms, so shutdown is only seen between drains
      loop {
        tokio::select! {
          _ = stop.changed() => {
            debug!("Offline sync worker shutting down");
            break;
          }
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
            let is_online = *online.borrow_and_update();
            if is_online {
              info!("Back online, draining pending operations");
              services.coordinator.sync_now().await;
            }
          }
          _ = next_tick(&mut ticker) => {
            if services.connectivity.is_online() {
              debug!("Periodic sync tick");
              services.coordinator.sync_now().await;
            }
          }
        }
      }
    });
    *worker = Some(Worker { handle, shutdown });
    info!(interval = ?self.sync_interval, "Offline sync worker started");
    Ok(())
  }

  /// Stop the background worker. A drain in flight runs to completion,
  /// releasing its lease, before the worker exits; no new drain starts.
  pub fn dispose(&self) {
    if let Ok(mut worker) = self.worker.lock() {
      if let Some(worker) = worker.take() {
        if worker.shutdown.send(true).is_err() {
          debug!("Offline sync worker already exited");
        }
        info!("Offline sync worker stopping");
      }
    }
  }

  pub fn is_running(&self) -> bool {
    self
      .worker
      .lock()
      .map(|w| w.as_ref().is_some_and(|w| !w.handle.is_finished()))
      .unwrap_or(false)
  }

  pub fn resource(&self, kind: ResourceKind) -> OfflineResource {
    OfflineResource::new(kind, self.services.clone())
  }

  pub fn admin(&self) -> CacheAdmin {
    CacheAdmin::new(self.services.clone())
  }

  pub fn set_online(&self, online: bool) {
    self.services.connectivity.set_online(online);
  }

  pub async fn sync_now(&self) -> SyncResult {
    self.services.coordinator.sync_now().await
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncResult> {
    self.services.coordinator.subscribe()
  }

  pub fn pending_status(&self) -> Result<PendingStatus> {
    self.services.coordinator.pending_status()
  }
}

impl Drop for OfflineContext {
  fn drop(&mut self) {
    self.dispose();
  }
}

fn open_store(config: &Config) -> Arc<dyn LocalStore> {
  if !config.storage.enabled {
    info!("Offline storage disabled; running online-only");
    return Arc::new(UnavailableStore::new("offline storage disabled"));
  }
  let Some(path) = config.database_path() else {
    warn!("No data directory available; running online-only");
    return Arc::new(UnavailableStore::new("no data directory"));
  };
  match SqliteStore::open(&path) {
    Ok(store) => {
      debug!(path = %path.display(), "Opened offline store");
      Arc::new(store)
    }
    Err(e) => {
      warn!(path = %path.display(), error = %e, "Offline store unavailable; running online-only");
      Arc::new(UnavailableStore::new(e.to_string()))
    }
  }
}

async fn next_tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending::<()>().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::RecordingSink;
  use crate::clock::ManualClock;
  use crate::remote::mock::ScriptedRemote;
  use crate::resource::Operation;
  use crate::sync::SYNC_LEASE;
  use serde_json::json;

  fn context(interval: Option<Duration>) -> (OfflineContext, Arc<ScriptedRemote>) {
    context_with(ScriptedRemote::new(|_| Ok(json!({}))), interval)
  }

  fn context_with(
    remote: ScriptedRemote,
    interval: Option<Duration>,
  ) -> (OfflineContext, Arc<ScriptedRemote>) {
    let remote = Arc::new(remote);
    let services = Services::new(
      &Config::default(),
      Arc::new(SqliteStore::open_in_memory().unwrap()),
      remote.clone(),
      Arc::new(ManualClock::new(1_000)),
      Arc::new(RecordingSink::default()),
    );
    (OfflineContext::new(Arc::new(services), interval), remote)
  }

  #[tokio::test]
  async fn test_online_transition_triggers_drain() {
    let (ctx, remote) = context(None);
    ctx.set_online(false);
    ctx
      .services()
      .queue
      .enqueue(ResourceKind::Tags, "3", json!({"name": "x"}), Operation::Update)
      .unwrap();
    let mut results = ctx.subscribe();

    ctx.init().unwrap();
    assert!(ctx.is_running());
    ctx.set_online(true);

    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(result.synced, 1);
    assert_eq!(remote.requests().len(), 1);

    ctx.dispose();
    assert!(!ctx.is_running());
  }

  #[tokio::test]
  async fn test_periodic_tick_drains_while_online() {
    let (ctx, _remote) = context(Some(Duration::from_millis(10)));
    ctx
      .services()
      .queue
      .enqueue(ResourceKind::Properties, "1", json!({}), Operation::Delete)
      .unwrap();
    let mut results = ctx.subscribe();

    ctx.init().unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(result.success);
    assert_eq!(ctx.pending_status().unwrap().pending, 0);
  }

  #[tokio::test]
  async fn test_init_is_idempotent() {
    let (ctx, _remote) = context(None);
    ctx.init().unwrap();
    ctx.init().unwrap();
    assert!(ctx.is_running());
    ctx.dispose();
    ctx.dispose();
    assert!(!ctx.is_running());
  }

  #[tokio::test]
  async fn test_dispose_lets_running_drain_finish() {
    let (ctx, remote) = context_with(
      ScriptedRemote::new(|_| Ok(json!({}))).with_delay(Duration::from_millis(30)),
      None,
    );
    ctx.set_online(false);
    for id in ["1", "2", "3"] {
      ctx
        .services()
        .queue
        .enqueue(ResourceKind::Tags, id, json!({}), Operation::Delete)
        .unwrap();
    }
    let mut results = ctx.subscribe();

    ctx.init().unwrap();
    ctx.set_online(true);
    tokio::time::timeout(Duration::from_secs(5), async {
      while !ctx.services().coordinator.is_syncing() {
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
    })
    .await
    .unwrap();

    ctx.dispose();
    assert!(!ctx.is_running());

    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(result.synced, 3);
    assert_eq!(remote.requests().len(), 3);
    assert_eq!(ctx.pending_status().unwrap().pending, 0);
    assert!(ctx
      .services()
      .store
      .acquire_lease(SYNC_LEASE, "other-process", 1_000, 1)
      .unwrap());
  }

  #[test]
  fn test_disabled_storage_degrades_to_unavailable_store() {
    let mut config = Config::default();
    config.storage.enabled = false;
    assert!(!open_store(&config).is_available());
  }
}
