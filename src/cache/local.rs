//! Local read cache (tier A).
//!
//! Entries persist in the durable store's `cacheEntries` collection so they
//! survive restarts. Capacity is bounded by entry count and approximate size;
//! when either bound is reached the least recently accessed entry is evicted
//! before a new one is written. Expired entries are removed lazily on read and
//! by an opportunistic sweep piggybacked on `set`.

use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::stats::{CacheMetadata, Counters};
use super::traits::{millis_to_datetime, CacheWriteResult, FailureSink, SwallowedFailure};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::db::{Collection, LocalStore};
use crate::error::{OfflineError, Result};
use crate::resource::CACHE_NAMESPACE;

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  /// Full namespaced key (`cache:...`)
  pub key: String,
  pub data: T,
  /// Creation time (ms)
  pub timestamp: i64,
  /// timestamp + ttl (ms); always greater than `timestamp`
  pub expires_at: i64,
  pub hit_count: u64,
  pub last_access: i64,
  /// Schema tag; entries with another version are discarded
  pub version: String,
}

impl<T: Serialize> CacheEntry<T> {
  pub fn new(key: String, data: T, now: i64, ttl_ms: i64, version: &str) -> Self {
    Self {
      key,
      data,
      timestamp: now,
      expires_at: now + ttl_ms.max(1),
      hit_count: 0,
      last_access: now,
      version: version.to_string(),
    }
  }

  /// Expired at or after `expires_at`.
  pub fn is_expired(&self, now: i64) -> bool {
    now >= self.expires_at
  }

  /// Approximate storage footprint: twice the serialized JSON length.
  pub fn estimated_size(&self) -> u64 {
    serde_json::to_string(self).map_or(0, |s| 2 * s.len() as u64)
  }
}

struct LocalState {
  counters: Counters,
  last_cleanup: i64,
}

/// Per-process read cache keyed by request fingerprint.
pub struct LocalCache {
  store: Arc<dyn LocalStore>,
  clock: Arc<dyn Clock>,
  sink: Arc<dyn FailureSink>,
  config: CacheConfig,
  state: Mutex<LocalState>,
}

impl LocalCache {
  pub fn new(
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn FailureSink>,
    config: CacheConfig,
  ) -> Self {
    let now = clock.now_ms();
    Self {
      store,
      clock,
      sink,
      config,
      state: Mutex::new(LocalState {
        counters: Counters::default(),
        last_cleanup: now,
      }),
    }
  }

  /// Namespaced key as stored.
  pub fn full_key(key: &str) -> String {
    let prefix = format!("{}:", CACHE_NAMESPACE);
    if key.starts_with(&prefix) {
      key.to_string()
    } else {
      format!("{}{}", prefix, key)
    }
  }

  /// Look up a live entry. Misses on absence, expiry, foreign version or
  /// undecodable data; expired entries are deleted.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_entry(key).map(|entry| entry.data)
  }

  /// Like [`LocalCache::get`], keeping the entry's bookkeeping.
  pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let full = Self::full_key(key);
    let now = self.clock.now_ms();

    let raw = match self.store.get(Collection::CacheEntries, &full) {
      Ok(raw) => raw,
      Err(e) => {
        self.report_failure("get", &full, e.to_string());
        None
      }
    };

    let Some(mut entry) = raw.and_then(|r| serde_json::from_value::<CacheEntry<Value>>(r).ok())
    else {
      self.record(false);
      return None;
    };

    if entry.version != self.config.version || entry.is_expired(now) {
      debug!(key = %full, "Cache entry expired");
      self.delete_entry(&full);
      self.record(false);
      return None;
    }

    let data = match serde_json::from_value::<T>(entry.data.clone()) {
      Ok(data) => data,
      Err(_) => {
        self.record(false);
        return None;
      }
    };

    entry.hit_count += 1;
    entry.last_access = now;
    if let Err(e) = serde_json::to_value(&entry)
      .map_err(OfflineError::from)
      .and_then(|v| self.store.put(Collection::CacheEntries, &v))
    {
      // The read still succeeds
      self.report_failure("touch", &full, e.to_string());
    }

    self.record(true);
    Some(CacheEntry {
      key: entry.key,
      data,
      timestamp: entry.timestamp,
      expires_at: entry.expires_at,
      hit_count: entry.hit_count,
      last_access: entry.last_access,
      version: entry.version,
    })
  }

  /// Store `data` under `key`. `ttl_ms` defaults to the configured TTL.
  pub fn set<T: Serialize>(&self, key: &str, data: &T, ttl_ms: Option<i64>) -> CacheWriteResult {
    let full = Self::full_key(key);
    let now = self.clock.now_ms();

    if self.cleanup_due(now) {
      if let Err(e) = self.cleanup_expired() {
        self.report_failure("cleanup", &full, e.to_string());
      }
    }

    let result = serde_json::to_value(data)
      .map_err(OfflineError::from)
      .and_then(|value| {
        let entry = CacheEntry::new(
          full.clone(),
          value,
          now,
          ttl_ms.unwrap_or(self.config.ttl_ms),
          &self.config.version,
        );
        self.ensure_capacity(&full)?;
        self.store.put(Collection::CacheEntries, &serde_json::to_value(&entry)?)
      });

    match result {
      Ok(()) => CacheWriteResult::Ok,
      Err(e) => self.swallow("set", &full, e.to_string()),
    }
  }

  /// Remove one entry; absent keys are fine.
  pub fn invalidate(&self, key: &str) -> CacheWriteResult {
    let full = Self::full_key(key);
    match self.store.delete(Collection::CacheEntries, &full) {
      Ok(()) => CacheWriteResult::Ok,
      Err(e) => self.swallow("invalidate", &full, e.to_string()),
    }
  }

  /// Remove every entry whose full key matches `pattern`.
  pub fn invalidate_pattern(&self, pattern: &Regex) -> CacheWriteResult {
    let result = self.entries().and_then(|entries| {
      let mut removed = 0;
      for entry in entries.iter().filter(|e| pattern.is_match(&e.key)) {
        self.store.delete(Collection::CacheEntries, &entry.key)?;
        removed += 1;
      }
      Ok(removed)
    });

    match result {
      Ok(removed) => {
        debug!(pattern = %pattern, removed, "Invalidated cache entries");
        CacheWriteResult::Ok
      }
      Err(e) => self.swallow("invalidate_pattern", pattern.as_str(), e.to_string()),
    }
  }

  /// Remove every cache entry. Other collections are untouched.
  pub fn clear(&self) -> CacheWriteResult {
    match self.store.clear(Collection::CacheEntries) {
      Ok(()) => CacheWriteResult::Ok,
      Err(e) => self.swallow("clear", CACHE_NAMESPACE, e.to_string()),
    }
  }

  /// Delete all expired entries. Returns how many were removed.
  pub fn cleanup_expired(&self) -> Result<usize> {
    let now = self.clock.now_ms();
    let mut removed = 0;
    for entry in self.entries()? {
      if entry.is_expired(now) || entry.version != self.config.version {
        self.store.delete(Collection::CacheEntries, &entry.key)?;
        removed += 1;
      }
    }
    if let Ok(mut state) = self.state.lock() {
      state.last_cleanup = now;
    }
    if removed > 0 {
      debug!(removed, "Swept expired cache entries");
    }
    Ok(removed)
  }

  /// Replace a temporary record id with its server id in keys and cached data.
  pub fn rewrite_id(&self, temp_id: &str, server_id: &str) -> CacheWriteResult {
    let result = self.entries().and_then(|entries| {
      for mut entry in entries {
        let data_changed = replace_string(&mut entry.data, temp_id, server_id);
        let new_key = entry
          .key
          .split(':')
          .map(|seg| if seg == temp_id { server_id } else { seg })
          .collect::<Vec<_>>()
          .join(":");
        if new_key != entry.key {
          self.store.delete(Collection::CacheEntries, &entry.key)?;
          entry.key = new_key;
        } else if !data_changed {
          continue;
        }
        self.store.put(Collection::CacheEntries, &serde_json::to_value(&entry)?)?;
      }
      Ok(())
    });

    match result {
      Ok(()) => CacheWriteResult::Ok,
      Err(e) => self.swallow("rewrite_id", temp_id, e.to_string()),
    }
  }

  pub fn stats(&self) -> CacheMetadata {
    let entries = self.entries().unwrap_or_default();
    let (counters, last_cleanup) = self
      .state
      .lock()
      .map(|s| (s.counters, s.last_cleanup))
      .unwrap_or_default();

    let mut stats = CacheMetadata {
      total_entries: entries.len(),
      total_size: entries.iter().map(CacheEntry::estimated_size).sum(),
      hits: counters.hits,
      misses: counters.misses,
      hit_rate: 0.0,
      last_cleanup: millis_to_datetime(last_cleanup),
    };
    stats.calculate_hit_rate();
    stats
  }

  fn entries(&self) -> Result<Vec<CacheEntry<Value>>> {
    Ok(
      self
        .store
        .get_all(Collection::CacheEntries)?
        .into_iter()
        .filter_map(|raw| serde_json::from_value(raw).ok())
        .collect(),
    )
  }

  /// Evict the least recently accessed entry if another insert would exceed
  /// either bound. Overwriting `incoming` does not count as growth.
  fn ensure_capacity(&self, incoming: &str) -> Result<()> {
    let others: Vec<CacheEntry<Value>> = self
      .entries()?
      .into_iter()
      .filter(|e| e.key != incoming)
      .collect();
    let total_size: u64 = others.iter().map(CacheEntry::estimated_size).sum();

    if others.len() >= self.config.max_entries || total_size >= self.config.max_size_bytes {
      if let Some(victim) = others.iter().min_by_key(|e| e.last_access) {
        debug!(key = %victim.key, "Evicting least recently used cache entry");
        self.store.delete(Collection::CacheEntries, &victim.key)?;
      }
    }
    Ok(())
  }

  fn cleanup_due(&self, now: i64) -> bool {
    self
      .state
      .lock()
      .map(|s| now - s.last_cleanup > self.config.cleanup_interval_ms)
      .unwrap_or(false)
  }

  fn delete_entry(&self, full: &str) {
    if let Err(e) = self.store.delete(Collection::CacheEntries, full) {
      self.report_failure("expire", full, e.to_string());
    }
  }

  fn record(&self, hit: bool) {
    if let Ok(mut state) = self.state.lock() {
      if hit {
        state.counters.hits += 1;
      } else {
        state.counters.misses += 1;
      }
    }
  }

  fn report_failure(&self, operation: &str, key: &str, reason: String) {
    self.sink.report(SwallowedFailure {
      component: "local_cache",
      operation: format!("{} {}", operation, key),
      reason,
    });
  }

  fn swallow(&self, operation: &str, key: &str, reason: String) -> CacheWriteResult {
    self.report_failure(operation, key, reason.clone());
    CacheWriteResult::Failed(reason)
  }
}

/// Replace every string equal to `from` inside `value`. Returns whether anything changed.
pub(crate) fn replace_string(value: &mut Value, from: &str, to: &str) -> bool {
  match value {
    Value::String(s) if s == from => {
      *s = to.to_string();
      true
    }
    Value::Array(items) => items
      .iter_mut()
      .fold(false, |changed, v| replace_string(v, from, to) || changed),
    Value::Object(map) => map
      .values_mut()
      .fold(false, |changed, v| replace_string(v, from, to) || changed),
    _ => false,
  }
}
