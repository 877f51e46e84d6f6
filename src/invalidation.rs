//! Maps "a write happened" to "which cache entries must go".
//!
//! Every write to a resource family invalidates that family and the
//! dashboard aggregate in both cache tiers. Invalidation never fails the
//! write; failures are logged at error level and reported to the sink.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};

use crate::cache::{
  CacheWriteResult, FailureSink, LocalCache, RevalidationReport, SharedCache, SwallowedFailure,
};
use crate::error::OfflineError;
use crate::resource::{Operation, ResourceKind, CACHE_NAMESPACE, DASHBOARD_TAG};

/// What a write touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationTarget {
  Resource(ResourceKind),
  Dashboard,
}

impl InvalidationTarget {
  /// Shared-cache tags to revalidate, the dashboard always last.
  pub fn tags(&self) -> Vec<&'static str> {
    match self {
      InvalidationTarget::Resource(kind) => vec![kind.cache_tag(), DASHBOARD_TAG],
      InvalidationTarget::Dashboard => vec![DASHBOARD_TAG],
    }
  }

  /// Local-cache key patterns to remove.
  pub fn patterns(&self) -> Vec<String> {
    self
      .tags()
      .into_iter()
      .map(|tag| format!("^{}", regex::escape(&format!("{}:{}", CACHE_NAMESPACE, tag))))
      .collect()
  }
}

impl From<ResourceKind> for InvalidationTarget {
  fn from(kind: ResourceKind) -> Self {
    InvalidationTarget::Resource(kind)
  }
}

impl fmt::Display for InvalidationTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InvalidationTarget::Resource(kind) => write!(f, "{}", kind),
      InvalidationTarget::Dashboard => f.write_str(DASHBOARD_TAG),
    }
  }
}

impl FromStr for InvalidationTarget {
  type Err = OfflineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s == DASHBOARD_TAG {
      return Ok(InvalidationTarget::Dashboard);
    }
    s.parse::<ResourceKind>().map(InvalidationTarget::Resource)
  }
}

/// What an invalidation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
  /// Local-cache patterns removed
  pub local_patterns: Vec<String>,
  /// `(pattern, reason)` for local-cache failures
  pub local_failures: Vec<(String, String)>,
  pub shared: RevalidationReport,
}

impl InvalidationReport {
  pub fn is_ok(&self) -> bool {
    self.local_failures.is_empty() && self.shared.is_ok()
  }
}

pub struct InvalidationOrchestrator {
  local: Arc<LocalCache>,
  shared: Arc<SharedCache>,
  sink: Arc<dyn FailureSink>,
}

impl InvalidationOrchestrator {
  pub fn new(local: Arc<LocalCache>, shared: Arc<SharedCache>, sink: Arc<dyn FailureSink>) -> Self {
    Self {
      local,
      shared,
      sink,
    }
  }

  /// Invalidate both tiers for a write to `target`. Both tiers are handled
  /// concurrently; the returned report is informational only.
  pub async fn invalidate_after(
    &self,
    target: impl Into<InvalidationTarget>,
    action: Operation,
  ) -> InvalidationReport {
    let target = target.into();
    let patterns = target.patterns();
    let tags = target.tags();

    let local = async {
      let mut failures = Vec::new();
      for pattern in &patterns {
        let outcome = match Regex::new(pattern) {
          Ok(re) => self.local.invalidate_pattern(&re),
          Err(e) => CacheWriteResult::Failed(e.to_string()),
        };
        if let CacheWriteResult::Failed(reason) = outcome {
          failures.push((pattern.clone(), reason));
        }
      }
      failures
    };
    let shared = async { self.shared.revalidate_all(&tags) };

    let (local_failures, shared) = futures::join!(local, shared);

    let report = InvalidationReport {
      local_patterns: patterns,
      local_failures,
      shared,
    };

    if report.is_ok() {
      debug!(%target, %action, "Invalidated caches after write");
    } else {
      error!(
        %target,
        %action,
        local_failures = ?report.local_failures,
        shared_failures = ?report.shared.failed,
        "Cache invalidation failed; cached reads may be stale"
      );
      for (what, reason) in report
        .local_failures
        .iter()
        .chain(report.shared.failed.iter())
      {
        self.sink.report(SwallowedFailure {
          component: "invalidation",
          operation: format!("{} {} ({})", action, target, what),
          reason: reason.clone(),
        });
      }
    }

    report
  }
}
