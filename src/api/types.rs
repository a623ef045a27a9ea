//! Wire-level request and response shapes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Path of the daily health upsert endpoint.
pub const HEALTH_DAILY_PATH: &str = "/api/v1/health/daily";

/// Logical backend endpoints the core reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
  CalendarEvents,
  DailySummary,
  HealthInsights,
  /// Any other GET endpoint, by path
  Other(String),
}

impl Endpoint {
  /// Short stable name used as the cache key prefix.
  pub fn name(&self) -> &str {
    match self {
      Endpoint::CalendarEvents => "calendar",
      Endpoint::DailySummary => "summary",
      Endpoint::HealthInsights => "insights",
      Endpoint::Other(path) => path.trim_matches('/'),
    }
  }

  pub fn path(&self) -> String {
    match self {
      Endpoint::CalendarEvents => "/api/v1/calendar/events".to_string(),
      Endpoint::DailySummary => "/api/v1/summaries/daily".to_string(),
      Endpoint::HealthInsights => "/api/v1/health/insights".to_string(),
      Endpoint::Other(path) => format!("/{}", path.trim_matches('/')),
    }
  }
}

/// A GET request: endpoint plus query parameters in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
  pub endpoint: Endpoint,
  pub params: BTreeMap<String, String>,
}

impl ApiRequest {
  pub fn new(endpoint: Endpoint) -> Self {
    Self {
      endpoint,
      params: BTreeMap::new(),
    }
  }

  pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.params.insert(key.into(), value.into());
    self
  }
}

/// Body returned by the health upsert endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertResponse {
  pub status: String,
  #[serde(rename = "recordsUpserted", alias = "records_upserted", default)]
  pub records_upserted: u32,
}
