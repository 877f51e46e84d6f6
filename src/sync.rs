//! Sync coordinator.
//!
//! Drains the pending-operation queue against the remote API. One drain runs
//! at a time: a per-instance flag guards against re-entry, and a lease row in
//! the durable store guards against other processes sharing the database.
//! A drain replays the entries that were unsynced when it started, in FIFO
//! order, and never aborts on a single failed entry. The lease is renewed
//! before every entry; a drain that loses it stops where it is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{replace_string, CacheWriteResult, LocalCache};
use crate::clock::Clock;
use crate::db::LocalStore;
use crate::error::{OfflineError, Result};
use crate::invalidation::InvalidationOrchestrator;
use crate::queue::{PendingOperation, PendingQueue};
use crate::remote::RemoteApi;
use crate::resource::{is_temp_id, patched, record_id, Operation, ResourceKind};

/// Name of the cross-process drain lease.
pub const SYNC_LEASE: &str = "sync";

pub const ALREADY_IN_PROGRESS: &str = "Sync already in progress";

pub const LEASE_LOST: &str = "Sync lease lost to another process";

/// Outcome of one drain cycle, published to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
  /// True iff no entry failed
  pub success: bool,
  pub synced: usize,
  pub failed: usize,
  pub errors: Vec<String>,
  /// Entries skipped because they hit the retry cap
  #[serde(default, skip_serializing_if = "is_zero")]
  pub needs_resolution: usize,
}

fn is_zero(n: &usize) -> bool {
  *n == 0
}

impl SyncResult {
  fn rejected(reason: impl Into<String>) -> Self {
    Self {
      success: false,
      errors: vec![reason.into()],
      ..Self::default()
    }
  }

  pub fn already_in_progress() -> Self {
    Self::rejected(ALREADY_IN_PROGRESS)
  }

  pub fn is_already_in_progress(&self) -> bool {
    self.synced == 0 && self.failed == 0 && self.errors == [ALREADY_IN_PROGRESS]
  }
}

/// Outstanding work, for status indicators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStatus {
  pub pending: usize,
  pub needs_resolution: usize,
  pub syncing: bool,
}

/// Clears the in-progress flag when the drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

static OWNER_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct SyncCoordinator {
  queue: Arc<PendingQueue>,
  store: Arc<dyn LocalStore>,
  remote: Arc<dyn RemoteApi>,
  local: Arc<LocalCache>,
  orchestrator: Arc<InvalidationOrchestrator>,
  clock: Arc<dyn Clock>,
  lease_ttl_ms: i64,
  owner: String,
  in_progress: AtomicBool,
  events: broadcast::Sender<SyncResult>,
}

impl SyncCoordinator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    queue: Arc<PendingQueue>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    local: Arc<LocalCache>,
    orchestrator: Arc<InvalidationOrchestrator>,
    clock: Arc<dyn Clock>,
    lease_ttl_ms: i64,
  ) -> Self {
    let owner = format!(
      "{}-{}-{}",
      std::process::id(),
      clock.now_ms(),
      OWNER_SEQ.fetch_add(1, Ordering::SeqCst)
    );
    let (events, _) = broadcast::channel(16);
    Self {
      queue,
      store,
      remote,
      local,
      orchestrator,
      clock,
      lease_ttl_ms,
      owner,
      in_progress: AtomicBool::new(false),
      events,
    }
  }

  /// Receive every completed cycle's result.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncResult> {
    self.events.subscribe()
  }

  pub fn is_syncing(&self) -> bool {
    self.in_progress.load(Ordering::SeqCst)
  }

  pub fn pending_status(&self) -> Result<PendingStatus> {
    Ok(PendingStatus {
      pending: self.queue.pending_count()?,
      needs_resolution: self.queue.needs_resolution()?.len(),
      syncing: self.is_syncing(),
    })
  }

  /// Run one drain cycle. A call made while another cycle is running, here or
  /// in another process holding the lease, returns immediately without
  /// touching the queue.
  pub async fn sync_now(&self) -> SyncResult {
    if self
      .in_progress
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("Sync requested while a drain is running");
      return SyncResult::already_in_progress();
    }
    let _guard = DrainGuard(&self.in_progress);

    match self.store.acquire_lease(
      SYNC_LEASE,
      &self.owner,
      self.clock.now_ms(),
      self.lease_ttl_ms,
    ) {
      Ok(true) => {}
      Ok(false) => {
        debug!("Sync lease held by another process");
        return SyncResult::already_in_progress();
      }
      Err(e) => {
        warn!(error = %e, "Cannot sync without local storage");
        return SyncResult::rejected(e.to_string());
      }
    }

    let result = match self.queue.list_unsynced() {
      Ok(snapshot) => self.drain(snapshot).await,
      Err(e) => SyncResult::rejected(e.to_string()),
    };

    if let Err(e) = self.store.release_lease(SYNC_LEASE, &self.owner) {
      warn!(error = %e, "Failed to release sync lease");
    }

    if result.success {
      info!(synced = result.synced, "Sync completed");
    } else {
      warn!(
        synced = result.synced,
        failed = result.failed,
        needs_resolution = result.needs_resolution,
        "Sync completed with errors"
      );
    }
    // No subscribers is fine
    let _ = self.events.send(result.clone());
    result
  }

  async fn drain(&self, snapshot: Vec<PendingOperation>) -> SyncResult {
    let mut result = SyncResult::default();
    info!(entries = snapshot.len(), "Draining pending operations");

    let mut lease_lost = false;

    for queued in snapshot {
      if !self.renew_lease() {
        result.errors.push(LEASE_LOST.to_string());
        lease_lost = true;
        break;
      }

      // Re-read: an earlier create in this cycle may have rewritten the id
      let op = match self.queue.get(queued.id) {
        Ok(Some(op)) if !op.synced => op,
        Ok(_) => continue,
        Err(e) => {
          result.failed += 1;
          result.errors.push(entry_error(&queued, &e));
          continue;
        }
      };

      match self.queue.list_unsynced() {
        Ok(unsynced) if self.queue.awaits_resolution(&op, &unsynced) => {
          result.needs_resolution += 1;
          continue;
        }
        Ok(_) => {}
        Err(e) => {
          result.failed += 1;
          result.errors.push(entry_error(&op, &e));
          continue;
        }
      }

      match self.replay(&op).await {
        Ok(()) => result.synced += 1,
        Err(e) => {
          result.failed += 1;
          result.errors.push(entry_error(&op, &e));
        }
      }
    }

    result.success = result.failed == 0 && !lease_lost;
    result
  }

  /// Extend the drain lease. False once another process has taken it.
  fn renew_lease(&self) -> bool {
    match self.store.acquire_lease(
      SYNC_LEASE,
      &self.owner,
      self.clock.now_ms(),
      self.lease_ttl_ms,
    ) {
      Ok(true) => true,
      Ok(false) => {
        warn!("Sync lease taken over by another process, stopping drain");
        false
      }
      Err(e) => {
        warn!(error = %e, "Failed to renew sync lease, stopping drain");
        false
      }
    }
  }

  async fn replay(&self, op: &PendingOperation) -> Result<()> {
    let kind = op.table_name;

    // Dependents of an exhausted create were already set aside by the drain
    if op.operation != Operation::Create && is_temp_id(&op.record_id) {
      let create_pending = self
        .queue
        .list_unsynced()?
        .iter()
        .any(|other| other.operation == Operation::Create && other.record_id == op.record_id);
      let reason = format!("record {} has not been created on the server", op.record_id);
      if !create_pending {
        self.queue.record_failure(op.id, &reason)?;
      }
      return Err(OfflineError::InvalidRecord(reason));
    }

    let request = kind.mutation_request(op.operation, &op.record_id, &outgoing_payload(op));
    let response = match self.remote.send(request).await {
      Ok(body) => body,
      Err(e) => {
        if let Err(store_err) = self.queue.record_failure(op.id, &e.to_string()) {
          warn!(id = op.id, error = %store_err, "Failed to record sync attempt");
        }
        return Err(e);
      }
    };

    self.queue.mark_synced(op.id)?;
    debug!(id = op.id, table = %kind, operation = %op.operation, "Replayed pending operation");

    let mut acknowledged_id = op.record_id.clone();
    if op.operation == Operation::Create && is_temp_id(&op.record_id) {
      match record_id(&response) {
        Some(server_id) => {
          self.reconcile(kind, &op.record_id, &server_id)?;
          acknowledged_id = server_id;
        }
        None => warn!(
          temp_id = %op.record_id,
          "Create response carried no id; temporary id left in place"
        ),
      }
    }

    if op.operation != Operation::Delete {
      self.write_back(kind, &acknowledged_id, &response);
    }

    self.orchestrator.invalidate_after(kind, op.operation).await;
    Ok(())
  }

  /// Fold an acknowledged record into the stored snapshot. Skipped while
  /// later edits of the record are still queued: the stored copy already
  /// carries them.
  fn write_back(&self, kind: ResourceKind, id: &str, response: &Value) {
    if !response.is_object() {
      return;
    }
    let outcome = self.queue.list_unsynced().and_then(|unsynced| {
      if unsynced
        .iter()
        .any(|other| other.table_name == kind && other.record_id == id)
      {
        debug!(table = %kind, id, "Newer edits queued, keeping stored copy");
        return Ok(());
      }
      let stored = self.store.get(kind.collection(), id)?;
      self.store.put(kind.collection(), &patched(stored, response, id))
    });
    if let Err(e) = outcome {
      warn!(table = %kind, id, error = %e, "Acknowledged record not stored");
    }
  }

  /// Replace `temp_id` with `server_id` in the queue, every snapshot and the
  /// local cache. The optimistic record keeps any offline edits merged into
  /// it.
  fn reconcile(&self, kind: ResourceKind, temp_id: &str, server_id: &str) -> Result<()> {
    info!(table = %kind, temp_id, server_id, "Reconciling temporary id");

    self.queue.rewrite_record_id(temp_id, server_id)?;

    if let Some(mut optimistic) = self.store.get(kind.collection(), temp_id)? {
      self.store.delete(kind.collection(), temp_id)?;
      replace_string(&mut optimistic, temp_id, server_id);
      self.store.put(kind.collection(), &optimistic)?;
    }

    // Other snapshots may reference the record, e.g. a rent entry's propertyId
    for other in ResourceKind::ALL {
      for mut record in self.store.get_all(other.collection())? {
        if replace_string(&mut record, temp_id, server_id) {
          self.store.put(other.collection(), &record)?;
        }
      }
    }

    if let CacheWriteResult::Failed(reason) = self.local.rewrite_id(temp_id, server_id) {
      // Already reported to the sink; stale keys expire on their own
      debug!(temp_id, reason = %reason, "Local cache keys not rewritten");
    }
    Ok(())
  }
}

/// Body sent for a replayed operation. Temporary ids never leave the device.
fn outgoing_payload(op: &PendingOperation) -> Value {
  let mut data = op.data.clone();
  if let Value::Object(map) = &mut data {
    if map.get("id").and_then(Value::as_str).is_some_and(is_temp_id) {
      map.remove("id");
    }
  }
  data
}

fn entry_error(op: &PendingOperation, e: &OfflineError) -> String {
  OfflineError::SyncEntryFailure {
    table: op.table_name.to_string(),
    record_id: op.record_id.clone(),
    reason: e.to_string(),
  }
  .to_string()
}
