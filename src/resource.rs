//! Resource kinds, mutation operations and their remote endpoints.
//!
//! Every resource type the offline layer knows about is a variant of
//! [`ResourceKind`]; endpoint paths, cache tags, key prefixes and storage
//! collections are all derived from it with exhaustive matches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::Collection;
use crate::error::OfflineError;
use crate::remote::{ApiRequest, Method};

/// Prefix shared by every read-cache key.
pub const CACHE_NAMESPACE: &str = "cache";

/// Tag and key segment of the dashboard/summary aggregate cache.
pub const DASHBOARD_TAG: &str = "dashboard";

/// Prefix of client-generated identifiers for records created offline.
pub const TEMP_ID_PREFIX: &str = "temp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
  Properties,
  RentEntries,
  ExpenseEntries,
  Tags,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 4] = [
    ResourceKind::Properties,
    ResourceKind::RentEntries,
    ResourceKind::ExpenseEntries,
    ResourceKind::Tags,
  ];

  /// Discriminator stored in `PendingOperation::table_name`.
  pub fn table_name(&self) -> &'static str {
    match self {
      ResourceKind::Properties => "properties",
      ResourceKind::RentEntries => "rentEntries",
      ResourceKind::ExpenseEntries => "expenseEntries",
      ResourceKind::Tags => "tags",
    }
  }

  /// URL segment under `/api`.
  pub fn path_segment(&self) -> &'static str {
    match self {
      ResourceKind::Properties => "properties",
      ResourceKind::RentEntries => "rent-entries",
      ResourceKind::ExpenseEntries => "expense-entries",
      ResourceKind::Tags => "tags",
    }
  }

  /// Tag used for shared-cache invalidation.
  pub fn cache_tag(&self) -> &'static str {
    self.path_segment()
  }

  /// Key prefix of every read-cache entry for this resource family.
  pub fn cache_prefix(&self) -> String {
    format!("{}:{}", CACHE_NAMESPACE, self.path_segment())
  }

  /// Durable store collection holding the cached snapshot.
  pub fn collection(&self) -> Collection {
    match self {
      ResourceKind::Properties => Collection::Properties,
      ResourceKind::RentEntries => Collection::RentEntries,
      ResourceKind::ExpenseEntries => Collection::ExpenseEntries,
      ResourceKind::Tags => Collection::Tags,
    }
  }

  pub fn collection_path(&self) -> String {
    format!("/api/{}", self.path_segment())
  }

  pub fn record_path(&self, id: &str) -> String {
    format!("/api/{}/{}", self.path_segment(), id)
  }

  /// Request that replays `operation` against the remote API.
  pub fn mutation_request(
    &self,
    operation: Operation,
    record_id: &str,
    data: &serde_json::Value,
  ) -> ApiRequest {
    match operation {
      Operation::Create => ApiRequest::new(Method::Post, self.collection_path()).with_body(data.clone()),
      Operation::Update => {
        ApiRequest::new(Method::Put, self.record_path(record_id)).with_body(data.clone())
      }
      Operation::Delete => ApiRequest::new(Method::Delete, self.record_path(record_id)),
    }
  }

  pub fn list_request(&self, cursor: Option<&str>) -> ApiRequest {
    let request = ApiRequest::new(Method::Get, self.collection_path());
    match cursor {
      Some(c) => request.with_query("cursor", c),
      None => request,
    }
  }

  pub fn get_request(&self, id: &str) -> ApiRequest {
    ApiRequest::new(Method::Get, self.record_path(id))
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.table_name())
  }
}

impl FromStr for ResourceKind {
  type Err = OfflineError;

  /// Accepts both the table name (`rentEntries`) and the URL segment (`rent-entries`).
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ResourceKind::ALL
      .into_iter()
      .find(|k| k.table_name() == s || k.path_segment() == s)
      .ok_or_else(|| OfflineError::InvalidRecord(format!("unknown resource type '{}'", s)))
  }
}

/// Kind of mutation recorded in the pending-operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Operation {
  type Err = OfflineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(Operation::Create),
      "update" => Ok(Operation::Update),
      "delete" => Ok(Operation::Delete),
      other => Err(OfflineError::InvalidRecord(format!(
        "unknown operation '{}'",
        other
      ))),
    }
  }
}

/// Whether `id` was generated locally for a record created offline.
pub fn is_temp_id(id: &str) -> bool {
  id.starts_with(TEMP_ID_PREFIX)
}

/// Server id of a record, accepting both string and numeric `id` fields.
pub fn record_id(record: &serde_json::Value) -> Option<String> {
  match record.get("id")? {
    serde_json::Value::String(s) => Some(s.clone()),
    serde_json::Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// `patch` applied over `previous` (or over nothing) with a shallow
/// last-write-wins merge, keyed by `id`.
pub fn patched(
  previous: Option<serde_json::Value>,
  patch: &serde_json::Value,
  id: &str,
) -> serde_json::Value {
  use serde_json::Value;

  let mut record = previous.unwrap_or_else(|| serde_json::json!({}));
  if let (Value::Object(base), Value::Object(fields)) = (&mut record, patch) {
    for (k, v) in fields {
      base.insert(k.clone(), v.clone());
    }
  }
  if let Value::Object(map) = &mut record {
    map.insert("id".to_string(), serde_json::json!(id));
  }
  record
}
