//! Two-tier read cache.
//!
//! - [`LocalCache`]: per-process cache persisted in the durable store, with
//!   TTL, LRU eviction and pattern invalidation
//! - [`SharedCache`]: cross-request cache with tag-based revalidation
//!
//! Both tiers are best-effort: failures are reported to a [`FailureSink`]
//! and never fail the operation that triggered them.

mod local;
mod shared;
mod stats;
mod traits;

pub use local::{CacheEntry, LocalCache};
pub(crate) use local::replace_string;
pub use shared::{RevalidationReport, SharedCache};
pub use stats::CacheMetadata;
pub use traits::{
  CacheResult, CacheSource, CacheWriteResult, FailureSink, RecordingSink, SwallowedFailure,
  TracingSink,
};

use sha2::{Digest, Sha256};

/// Cache key for a request: `<resource family>:<scope>:<fingerprint>`.
///
/// The fingerprint is a SHA256 of the normalized request parameters so
/// equivalent requests share an entry.
pub fn request_key(family: &str, scope: &str, params: &[(&str, &str)]) -> String {
  let mut sorted: Vec<_> = params.to_vec();
  sorted.sort();
  let input = sorted
    .iter()
    .map(|(k, v)| format!("{}={}", k, v.trim()))
    .collect::<Vec<_>>()
    .join("&");

  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  let digest = hex::encode(hasher.finalize());
  format!("{}:{}:{}", family, scope, &digest[..16])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_key_ignores_param_order() {
    let a = request_key("properties", "list", &[("page", "1"), ("q", "flat")]);
    let b = request_key("properties", "list", &[("q", "flat "), ("page", "1")]);
    assert_eq!(a, b);
    assert!(a.starts_with("properties:list:"));

    let c = request_key("properties", "list", &[("page", "2")]);
    assert_ne!(a, c);
  }
}
