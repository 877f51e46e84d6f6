//! Error taxonomy for the offline data layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OfflineError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OfflineError {
  /// The durable local store cannot be opened or used.
  #[error("Local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A request to the remote API failed (transport error, timeout or non-2xx).
  #[error("Network failure: {0}")]
  NetworkFailure(String),

  /// A single pending operation failed to replay.
  #[error("Sync failed for {table} {record_id}: {reason}")]
  SyncEntryFailure {
    table: String,
    record_id: String,
    reason: String,
  },

  /// A cache write or invalidation failed.
  #[error("Cache write failed: {0}")]
  CacheWriteFailure(String),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Invalid record: {0}")]
  InvalidRecord(String),
}

impl OfflineError {
  /// Whether the failure should send a write down the optimistic path.
  pub fn is_network(&self) -> bool {
    matches!(self, OfflineError::NetworkFailure(_))
  }
}

impl From<rusqlite::Error> for OfflineError {
  fn from(e: rusqlite::Error) -> Self {
    OfflineError::StorageUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for OfflineError {
  fn from(e: serde_json::Error) -> Self {
    OfflineError::Serialization(e.to_string())
  }
}

impl From<reqwest::Error> for OfflineError {
  fn from(e: reqwest::Error) -> Self {
    OfflineError::NetworkFailure(e.to_string())
  }
}
