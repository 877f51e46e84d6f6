//! Pending-operation queue.
//!
//! Append-only log of mutations the remote API has not acknowledged yet,
//! persisted in the durable store's `offlineData` collection. Entries with
//! `synced == false` are exactly the outstanding work; the flag only ever
//! moves from false to true.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::replace_string;
use crate::clock::Clock;
use crate::db::{Collection, LocalStore};
use crate::error::{OfflineError, Result};
use crate::resource::{is_temp_id, Operation, ResourceKind};

/// A queued, not yet acknowledged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
  /// Local autoincrement id; defines replay order
  pub id: i64,
  pub table_name: ResourceKind,
  /// Server id, or a `temp_` id for records created offline
  pub record_id: String,
  /// Record payload at enqueue time
  pub data: Value,
  pub operation: Operation,
  pub timestamp: i64,
  pub synced: bool,
  pub sync_attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl PendingOperation {
  fn to_record(&self) -> Result<Value> {
    Ok(serde_json::to_value(self)?)
  }
}

/// Queue of pending operations over the durable store.
pub struct PendingQueue {
  store: Arc<dyn LocalStore>,
  clock: Arc<dyn Clock>,
  max_attempts: u32,
}

impl PendingQueue {
  pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
    Self {
      store,
      clock,
      max_attempts,
    }
  }

  /// Persist a new unsynced operation. A storage failure is returned to the
  /// caller: an offline write that cannot be queued must not look successful.
  pub fn enqueue(
    &self,
    kind: ResourceKind,
    record_id: &str,
    data: Value,
    operation: Operation,
  ) -> Result<PendingOperation> {
    let op = PendingOperation {
      id: self.store.next_id(Collection::OfflineData)?,
      table_name: kind,
      record_id: record_id.to_string(),
      data,
      operation,
      timestamp: self.clock.now_ms(),
      synced: false,
      sync_attempts: 0,
      last_error: None,
    };
    self.store.put(Collection::OfflineData, &op.to_record()?)?;
    info!(id = op.id, table = %kind, record_id, %operation, "Queued pending operation");
    Ok(op)
  }

  pub fn get(&self, id: i64) -> Result<Option<PendingOperation>> {
    self
      .store
      .get(Collection::OfflineData, &id.to_string())?
      .map(decode)
      .transpose()
  }

  /// Every entry, synced or not, in enqueue order.
  pub fn list_all(&self) -> Result<Vec<PendingOperation>> {
    let mut ops = self
      .store
      .get_all(Collection::OfflineData)?
      .into_iter()
      .map(decode)
      .collect::<Result<Vec<_>>>()?;
    ops.sort_by_key(|op| op.id);
    Ok(ops)
  }

  /// Unsynced entries in enqueue (FIFO) order.
  pub fn list_unsynced(&self) -> Result<Vec<PendingOperation>> {
    let mut ops = self
      .store
      .get_by_index(Collection::OfflineData, "synced", &json!(false))?
      .into_iter()
      .map(decode)
      .collect::<Result<Vec<_>>>()?;
    ops.sort_by_key(|op| op.id);
    Ok(ops)
  }

  /// Mark an entry acknowledged. Returns whether this call changed it; a
  /// second call on the same id is a no-op.
  pub fn mark_synced(&self, id: i64) -> Result<bool> {
    let Some(mut op) = self.get(id)? else {
      warn!(id, "mark_synced on unknown pending operation");
      return Ok(false);
    };
    if op.synced {
      return Ok(false);
    }
    op.synced = true;
    op.last_error = None;
    self.store.put(Collection::OfflineData, &op.to_record()?)?;
    debug!(id, "Pending operation synced");
    Ok(true)
  }

  /// Count a failed replay. Returns the new attempt count.
  pub fn record_failure(&self, id: i64, error: &str) -> Result<u32> {
    let mut op = self
      .get(id)?
      .ok_or_else(|| OfflineError::InvalidRecord(format!("no pending operation {}", id)))?;
    op.sync_attempts += 1;
    op.last_error = Some(error.to_string());
    self.store.put(Collection::OfflineData, &op.to_record()?)?;
    Ok(op.sync_attempts)
  }

  /// Replace `temp_id` with `server_id` in every unsynced entry, both as the
  /// target `recordId` and wherever it appears in a payload (e.g. a rent
  /// entry's `propertyId`). Returns how many entries changed.
  pub fn rewrite_record_id(&self, temp_id: &str, server_id: &str) -> Result<usize> {
    let mut changed = 0;
    for mut op in self.list_unsynced()? {
      let mut touched = replace_string(&mut op.data, temp_id, server_id);
      if op.record_id == temp_id {
        op.record_id = server_id.to_string();
        touched = true;
      }
      if touched {
        self.store.put(Collection::OfflineData, &op.to_record()?)?;
        changed += 1;
      }
    }
    if changed > 0 {
      info!(temp_id, server_id, changed, "Reconciled queued operations");
    }
    Ok(changed)
  }

  /// Whether the entry used up its attempts and waits for manual resolution.
  pub fn is_exhausted(&self, op: &PendingOperation) -> bool {
    !op.synced && op.sync_attempts >= self.max_attempts
  }

  /// Whether `op` cannot replay without manual resolution: it is exhausted
  /// itself, or it updates or deletes a record created offline whose create
  /// is exhausted. `unsynced` is the current unsynced log.
  pub fn awaits_resolution(&self, op: &PendingOperation, unsynced: &[PendingOperation]) -> bool {
    if self.is_exhausted(op) {
      return true;
    }
    op.operation != Operation::Create
      && is_temp_id(&op.record_id)
      && unsynced.iter().any(|other| {
        other.operation == Operation::Create
          && other.record_id == op.record_id
          && self.is_exhausted(other)
      })
  }

  /// Unsynced entries still eligible for replay.
  pub fn pending_count(&self) -> Result<usize> {
    let unsynced = self.list_unsynced()?;
    Ok(
      unsynced
        .iter()
        .filter(|op| !self.awaits_resolution(op, &unsynced))
        .count(),
    )
  }

  /// Unsynced entries waiting for manual resolution.
  pub fn needs_resolution(&self) -> Result<Vec<PendingOperation>> {
    let unsynced = self.list_unsynced()?;
    Ok(
      unsynced
        .iter()
        .filter(|op| self.awaits_resolution(op, &unsynced))
        .cloned()
        .collect(),
    )
  }

  /// Reset the attempt counter so the next drain replays the entry again.
  pub fn retry(&self, id: i64) -> Result<()> {
    let mut op = self
      .get(id)?
      .ok_or_else(|| OfflineError::InvalidRecord(format!("no pending operation {}", id)))?;
    op.sync_attempts = 0;
    self.store.put(Collection::OfflineData, &op.to_record()?)?;
    Ok(())
  }

  /// Drop an entry without replaying it.
  pub fn discard(&self, id: i64) -> Result<()> {
    warn!(id, "Discarding pending operation");
    self.store.delete(Collection::OfflineData, &id.to_string())
  }

  /// Delete acknowledged entries. Returns how many were removed.
  pub fn prune_synced(&self) -> Result<usize> {
    let synced = self
      .store
      .get_by_index(Collection::OfflineData, "synced", &json!(true))?;
    for raw in &synced {
      let op = decode(raw.clone())?;
      self.store.delete(Collection::OfflineData, &op.id.to_string())?;
    }
    Ok(synced.len())
  }
}

fn decode(raw: Value) -> Result<PendingOperation> {
  Ok(serde_json::from_value(raw)?)
}
