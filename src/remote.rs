//! Remote bookkeeping API.
//!
//! The offline layer only needs one primitive: send a JSON request to
//! `/api/...` and get the JSON body back. Any transport error or non-2xx
//! status is a `NetworkFailure`.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{OfflineError, Result};
use crate::resource::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  fn as_reqwest(&self) -> reqwest::Method {
    match self {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    })
  }
}

/// A request against the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Absolute path, e.g. `/api/properties/42`
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_query(mut self, key: &str, value: &str) -> Self {
    self.query.push((key.to_string(), value.to_string()));
    self
  }
}

impl fmt::Display for ApiRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.path)
  }
}

/// Transport to the remote API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Send a request and return the JSON body (`Null` for empty bodies).
  async fn send(&self, request: ApiRequest) -> Result<Value>;
}

/// reqwest-backed remote API client.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| OfflineError::InvalidRecord(format!("invalid API URL '{}': {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| OfflineError::NetworkFailure(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn url_for(&self, request: &ApiRequest) -> Result<Url> {
    let mut url = self
      .base_url
      .join(&request.path)
      .map_err(|e| OfflineError::InvalidRecord(format!("invalid path '{}': {}", request.path, e)))?;
    if !request.query.is_empty() {
      url
        .query_pairs_mut()
        .extend_pairs(request.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Ok(url)
  }
}

#[async_trait]
impl RemoteApi for HttpRemote {
  async fn send(&self, request: ApiRequest) -> Result<Value> {
    let url = self.url_for(&request)?;
    debug!(%request, "Sending API request");

    let mut builder = self.client.request(request.method.as_reqwest(), url);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(OfflineError::NetworkFailure(format!(
        "{} returned {}",
        request, status
      )));
    }

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
  }
}

/// Fetch a full collection, following `nextCursor` until the last page.
///
/// Accepts either a bare JSON array or `{ "data": [...], "nextCursor": ... }`.
pub async fn list_all(remote: &dyn RemoteApi, kind: ResourceKind) -> Result<Vec<Value>> {
  let mut records = Vec::new();
  let mut cursor: Option<String> = None;

  loop {
    let page = remote.send(kind.list_request(cursor.as_deref())).await?;
    match page {
      Value::Array(items) => {
        records.extend(items);
        return Ok(records);
      }
      Value::Object(mut map) => {
        match map.remove("data") {
          Some(Value::Array(items)) => records.extend(items),
          _ => {
            return Err(OfflineError::InvalidRecord(format!(
              "unexpected list response for {}",
              kind
            )))
          }
        }
        match map.remove("nextCursor") {
          Some(Value::String(next)) if !next.is_empty() => cursor = Some(next),
          _ => return Ok(records),
        }
      }
      _ => {
        return Err(OfflineError::InvalidRecord(format!(
          "unexpected list response for {}",
          kind
        )))
      }
    }
  }
}
