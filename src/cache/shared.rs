//! Shared read cache (tier B).
//!
//! Caches expensive collection fetches across requests and sessions. Every
//! entry carries a set of tags; revalidating a tag drops all of its entries
//! so the next lookup recomputes, without a global flush. Expired entries are
//! dropped when they are looked up and swept on every store or revalidation,
//! so the map only holds live entries plus those expired since the last write.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::stats::{CacheMetadata, Counters};
use crate::clock::Clock;
use crate::error::{OfflineError, Result};

#[derive(Debug, Clone)]
struct SharedEntry {
  value: Value,
  expires_at: i64,
  tags: Vec<String>,
}

#[derive(Debug, Default)]
struct SharedState {
  entries: HashMap<String, SharedEntry>,
  by_tag: HashMap<String, HashSet<String>>,
  counters: Counters,
}

impl SharedState {
  /// Remove `key` and its tag memberships. Empty tag sets are dropped.
  fn remove(&mut self, key: &str) -> Option<SharedEntry> {
    let entry = self.entries.remove(key)?;
    for tag in &entry.tags {
      if let Some(keys) = self.by_tag.get_mut(tag) {
        keys.remove(key);
        if keys.is_empty() {
          self.by_tag.remove(tag);
        }
      }
    }
    Some(entry)
  }

  fn sweep_expired(&mut self, now: i64) -> usize {
    let expired: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, e)| now >= e.expires_at)
      .map(|(k, _)| k.clone())
      .collect();
    for key in &expired {
      self.remove(key);
    }
    expired.len()
  }
}

/// Outcome of revalidating several tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevalidationReport {
  /// Tags revalidated, in call order
  pub revalidated: Vec<String>,
  /// `(tag, reason)` for each tag that failed
  pub failed: Vec<(String, String)>,
}

impl RevalidationReport {
  pub fn is_ok(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Tag-invalidated cache shared by every consumer of a deployment.
pub struct SharedCache {
  state: RwLock<SharedState>,
  clock: Arc<dyn Clock>,
  default_ttl_secs: u64,
}

impl SharedCache {
  pub fn new(clock: Arc<dyn Clock>, default_ttl_secs: u64) -> Self {
    Self {
      state: RwLock::new(SharedState::default()),
      clock,
      default_ttl_secs,
    }
  }

  /// Return the cached value for `key`, or run `compute` and cache its result
  /// under `key` with every tag in `tags`. A failed compute is returned as-is
  /// and leaves the cache untouched.
  pub async fn get_or_compute<T, E, F, Fut>(
    &self,
    key: &str,
    tags: &[&str],
    ttl_secs: Option<u64>,
    compute: F,
  ) -> std::result::Result<T, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
  {
    if let Some(value) = self.lookup(key) {
      match serde_json::from_value::<T>(value) {
        Ok(hit) => return Ok(hit),
        Err(e) => warn!(key, error = %e, "Discarding undecodable shared cache entry"),
      }
    }

    let computed = compute().await?;

    match serde_json::to_value(&computed) {
      Ok(value) => self.store(key, tags, ttl_secs, value),
      Err(e) => warn!(key, error = %e, "Computed value not cacheable"),
    }

    Ok(computed)
  }

  /// Invalidate every entry tagged `tag`; the next lookup of any of them
  /// recomputes. Unknown tags are a no-op. Returns how many entries were
  /// invalidated.
  pub fn revalidate_tag(&self, tag: &str) -> Result<usize> {
    let now = self.clock.now_ms();
    let mut state = self
      .state
      .write()
      .map_err(|e| OfflineError::CacheWriteFailure(format!("Lock poisoned: {}", e)))?;

    let keys: Vec<String> = state
      .by_tag
      .get(tag)
      .map(|k| k.iter().cloned().collect())
      .unwrap_or_default();

    let marked = keys.iter().filter(|key| state.remove(key).is_some()).count();
    let swept = state.sweep_expired(now);

    debug!(tag, marked, swept, "Revalidated shared cache tag");
    Ok(marked)
  }

  /// Revalidate `tags` one after another; a failing tag does not stop the rest.
  pub fn revalidate_all(&self, tags: &[&str]) -> RevalidationReport {
    let mut report = RevalidationReport::default();
    for tag in tags {
      match self.revalidate_tag(tag) {
        Ok(_) => report.revalidated.push(tag.to_string()),
        Err(e) => {
          warn!(tag, error = %e, "Shared cache revalidation failed");
          report.failed.push((tag.to_string(), e.to_string()));
        }
      }
    }
    report
  }

  /// Whether `key` holds a live entry.
  pub fn contains(&self, key: &str) -> bool {
    let now = self.clock.now_ms();
    self
      .state
      .read()
      .map(|s| {
        s.entries
          .get(key)
          .is_some_and(|e| now < e.expires_at)
      })
      .unwrap_or(false)
  }

  pub fn clear(&self) -> Result<()> {
    let mut state = self
      .state
      .write()
      .map_err(|e| OfflineError::CacheWriteFailure(format!("Lock poisoned: {}", e)))?;
    state.entries.clear();
    state.by_tag.clear();
    Ok(())
  }

  pub fn stats(&self) -> CacheMetadata {
    let Ok(state) = self.state.read() else {
      return CacheMetadata::default();
    };
    let mut stats = CacheMetadata {
      total_entries: state.entries.len(),
      total_size: state
        .entries
        .values()
        .map(|e| serde_json::to_string(&e.value).map_or(0, |s| s.len() as u64))
        .sum(),
      hits: state.counters.hits,
      misses: state.counters.misses,
      hit_rate: 0.0,
      last_cleanup: None,
    };
    stats.calculate_hit_rate();
    stats
  }

  fn lookup(&self, key: &str) -> Option<Value> {
    let now = self.clock.now_ms();
    let mut state = self.state.write().ok()?;

    let live = match state.entries.get(key).map(|e| now < e.expires_at) {
      Some(true) => state.entries.get(key).map(|e| e.value.clone()),
      Some(false) => {
        state.remove(key);
        None
      }
      None => None,
    };

    if live.is_some() {
      state.counters.hits += 1;
    } else {
      state.counters.misses += 1;
    }
    live
  }

  fn store(&self, key: &str, tags: &[&str], ttl_secs: Option<u64>, value: Value) {
    let now = self.clock.now_ms();
    let ttl_ms = (ttl_secs.unwrap_or(self.default_ttl_secs).max(1) * 1000) as i64;

    let Ok(mut state) = self.state.write() else {
      warn!(key, "Shared cache lock poisoned; result not cached");
      return;
    };

    state.remove(key);
    let swept = state.sweep_expired(now);
    if swept > 0 {
      debug!(swept, "Swept expired shared cache entries");
    }

    for tag in tags {
      state
        .by_tag
        .entry(tag.to_string())
        .or_default()
        .insert(key.to_string());
    }

    state.entries.insert(
      key.to_string(),
      SharedEntry {
        value,
        expires_at: now + ttl_ms,
        tags: tags.iter().map(|t| t.to_string()).collect(),
      },
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn cache() -> (SharedCache, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    (SharedCache::new(clock.clone(), 300), clock)
  }

  async fn compute_count(
    cache: &SharedCache,
    key: &str,
    tags: &[&str],
    calls: &AtomicUsize,
  ) -> Vec<u32> {
    cache
      .get_or_compute(key, tags, None, || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, OfflineError>(vec![1, 2, 3])
      })
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_get_or_compute_caches() {
    let (cache, _clock) = cache();
    let calls = AtomicUsize::new(0);

    assert_eq!(compute_count(&cache, "properties:u1", &["properties"], &calls).await, vec![1, 2, 3]);
    compute_count(&cache, "properties:u1", &["properties"], &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
  }

  #[tokio::test]
  async fn test_expiry_recomputes() {
    let (cache, clock) = cache();
    let calls = AtomicUsize::new(0);

    compute_count(&cache, "k", &[], &calls).await;
    clock.advance(299_999);
    compute_count(&cache, "k", &[], &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(1);
    compute_count(&cache, "k", &[], &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_compute_is_not_cached() {
    let (cache, _clock) = cache();

    let failed: std::result::Result<Vec<u32>, String> = cache
      .get_or_compute("k", &["tags"], None, || async { Err("db down".to_string()) })
      .await;
    assert_eq!(failed, Err("db down".to_string()));
    assert!(!cache.contains("k"));

    let ok: std::result::Result<Vec<u32>, String> = cache
      .get_or_compute("k", &["tags"], None, || async { Ok(vec![7]) })
      .await;
    assert_eq!(ok, Ok(vec![7]));
    assert!(cache.contains("k"));
  }

  #[tokio::test]
  async fn test_revalidate_tag_only_hits_tagged_entries() {
    let (cache, _clock) = cache();
    let calls = AtomicUsize::new(0);

    compute_count(&cache, "properties:u1", &["properties", "dashboard"], &calls).await;
    compute_count(&cache, "tags:u1", &["tags"], &calls).await;

    assert_eq!(cache.revalidate_tag("properties").unwrap(), 1);
    assert!(!cache.contains("properties:u1"));
    assert!(cache.contains("tags:u1"));

    compute_count(&cache, "properties:u1", &["properties", "dashboard"], &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(cache.contains("properties:u1"));
  }

  #[test]
  fn test_revalidate_unknown_tag_is_noop() {
    let (cache, _clock) = cache();
    assert_eq!(cache.revalidate_tag("nothing").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_revalidate_all() {
    let (cache, _clock) = cache();
    let calls = AtomicUsize::new(0);
    compute_count(&cache, "a", &["one"], &calls).await;
    compute_count(&cache, "b", &["two"], &calls).await;

    let report = cache.revalidate_all(&["one", "missing", "two"]);
    assert!(report.is_ok());
    assert_eq!(report.revalidated, vec!["one", "missing", "two"]);
    assert!(!cache.contains("a"));
    assert!(!cache.contains("b"));
  }

  #[tokio::test]
  async fn test_retagging_drops_old_tags() {
    let (cache, _clock) = cache();
    let calls = AtomicUsize::new(0);
    compute_count(&cache, "k", &["old"], &calls).await;
    cache.revalidate_tag("old").unwrap();
    compute_count(&cache, "k", &["new"], &calls).await;

    assert_eq!(cache.revalidate_tag("old").unwrap(), 0);
    assert!(cache.contains("k"));
  }

  #[tokio::test]
  async fn test_expired_entries_are_swept() {
    let (cache, clock) = cache();
    for i in 0..100 {
      cache
        .get_or_compute(&format!("k{}", i), &["t"], Some(1), || async move {
          Ok::<_, OfflineError>(i)
        })
        .await
        .unwrap();
    }
    assert_eq!(cache.stats().total_entries, 100);

    clock.advance(10_000_000);
    assert_eq!(cache.revalidate_tag("t").unwrap(), 100);
    assert_eq!(cache.stats().total_entries, 0);
    assert!(cache.state.read().unwrap().by_tag.is_empty());
  }

  #[tokio::test]
  async fn test_store_sweeps_and_lookup_drops_expired() {
    let (cache, clock) = cache();
    let calls = AtomicUsize::new(0);
    compute_count(&cache, "a", &["x"], &calls).await;
    compute_count(&cache, "b", &["y"], &calls).await;

    clock.advance(300_000);
    // Miss on an expired key removes it before recomputing
    compute_count(&cache, "a", &["x"], &calls).await;

    let state = cache.state.read().unwrap();
    assert_eq!(state.entries.len(), 1);
    assert!(state.entries.contains_key("a"));
    assert!(!state.by_tag.contains_key("y"));
  }
}
