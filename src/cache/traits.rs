//! Core types shared by the cache tiers and the resource facade.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::warn;

/// Result from a read or write, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a live read-cache entry.
  pub fn from_cache(data: T, cached_at_ms: i64) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: millis_to_datetime(cached_at_ms),
    }
  }

  /// Hit in the shared tier. Its entries carry no creation time.
  pub fn from_shared(data: T) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: None,
    }
  }

  /// Network unavailable, serving the last stored snapshot.
  pub fn stale(data: T) -> Self {
    Self {
      data,
      source: CacheSource::CacheStale,
      cached_at: None,
    }
  }

  /// Network unavailable and nothing stored locally.
  pub fn empty(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Empty,
      cached_at: None,
    }
  }

  /// Write applied locally and queued for sync.
  pub fn optimistic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Optimistic,
      cached_at: None,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Read-cache hit in either tier; `cached_at` is only known for the
  /// local tier
  CacheFresh,
  /// Network failed, serving the stored snapshot
  CacheStale,
  /// Network failed and nothing was stored
  Empty,
  /// Local write pending sync
  Optimistic,
}

/// Outcome of a best-effort cache write. Never propagated as an error.
#[must_use = "a failed cache write should at least be logged"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWriteResult {
  Ok,
  Failed(String),
}

impl CacheWriteResult {
  pub fn is_ok(&self) -> bool {
    matches!(self, CacheWriteResult::Ok)
  }
}

/// A failure that was swallowed instead of failing the primary operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwallowedFailure {
  pub component: &'static str,
  pub operation: String,
  pub reason: String,
}

/// Receives failures the cache and invalidation layers swallow.
pub trait FailureSink: Send + Sync {
  fn report(&self, failure: SwallowedFailure);
}

/// Sink that logs through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl FailureSink for TracingSink {
  fn report(&self, failure: SwallowedFailure) {
    warn!(
      component = failure.component,
      operation = %failure.operation,
      reason = %failure.reason,
      "Cache operation failed"
    );
  }
}

/// Sink that keeps every failure in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
  failures: Mutex<Vec<SwallowedFailure>>,
}

impl RecordingSink {
  pub fn failures(&self) -> Vec<SwallowedFailure> {
    self
      .failures
      .lock()
      .map(|f| f.clone())
      .unwrap_or_default()
  }
}

impl FailureSink for RecordingSink {
  fn report(&self, failure: SwallowedFailure) {
    if let Ok(mut failures) = self.failures.lock() {
      failures.push(failure);
    }
  }
}

pub(crate) fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
  Utc.timestamp_millis_opt(ms).single()
}
