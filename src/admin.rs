//! Cache administration for operational tooling: targeted invalidation and
//! health metrics.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheMetadata, CacheWriteResult};
use crate::context::Services;
use crate::db::LocalStore;
use crate::error::{OfflineError, Result};
use crate::invalidation::InvalidationTarget;
use crate::resource::Operation;

/// `{ "operation": { "type": "properties", "action": "create" } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRequest {
  pub operation: InvalidationOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationOperation {
  /// Resource type (table name or URL segment) or `dashboard`
  #[serde(rename = "type")]
  pub resource_type: String,
  pub action: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationResponse {
  pub success: bool,
  pub invalidated_tags: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
  Healthy,
  /// Local storage unavailable; running online-only
  Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
  pub status: HealthStatus,
  pub metrics: CacheMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetrics {
  /// Local tier
  pub client: CacheMetadata,
  /// Shared tier
  pub server: CacheMetadata,
}

pub struct CacheAdmin {
  services: Arc<Services>,
}

impl CacheAdmin {
  pub fn new(services: Arc<Services>) -> Self {
    Self { services }
  }

  /// Run the orchestrator for the requested write. Unknown resource types
  /// are an error; invalidation failures are reported in the response.
  pub async fn invalidate(&self, request: &InvalidationRequest) -> Result<InvalidationResponse> {
    let target: InvalidationTarget = request.operation.resource_type.parse()?;
    info!(%target, action = %request.operation.action, "Invalidation requested");

    let report = self
      .services
      .orchestrator
      .invalidate_after(target, request.operation.action)
      .await;

    let errors = report
      .local_failures
      .iter()
      .chain(report.shared.failed.iter())
      .map(|(what, reason)| format!("{}: {}", what, reason))
      .collect::<Vec<_>>();

    Ok(InvalidationResponse {
      success: errors.is_empty(),
      invalidated_tags: report.shared.revalidated,
      errors,
    })
  }

  pub fn metrics(&self) -> MetricsResponse {
    let status = if self.services.store.is_available() {
      HealthStatus::Healthy
    } else {
      HealthStatus::Degraded
    };
    MetricsResponse {
      status,
      metrics: CacheMetrics {
        client: self.services.local.stats(),
        server: self.services.shared.stats(),
      },
    }
  }

  /// Empty both tiers. Snapshots and the pending queue are untouched.
  /// The shared tier is cleared even when the local tier fails.
  pub fn clear(&self) -> Result<()> {
    let local = self.services.local.clear();
    self.services.shared.clear()?;
    if let CacheWriteResult::Failed(reason) = local {
      return Err(OfflineError::CacheWriteFailure(format!(
        "local cache not cleared: {}",
        reason
      )));
    }
    info!("Caches cleared");
    Ok(())
  }

  /// Sweep expired local entries now.
  pub fn cleanup(&self) -> Result<usize> {
    self.services.local.cleanup_expired()
  }
}
