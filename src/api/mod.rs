//! Backend collaborators: authenticated JSON reads and the health upsert.

mod client;
mod types;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;
use crate::health::DailyHealthMetrics;

pub use client::{classify_status, ApiClient};
pub use types::{ApiRequest, Endpoint, UpsertResponse, HEALTH_DAILY_PATH};

/// Source of opaque JSON payloads keyed by endpoint and parameters.
#[async_trait]
pub trait DataSource: Send + Sync {
  async fn fetch(&self, request: &ApiRequest) -> Result<Value, FetchError>;
}

/// Destination for daily health records. The backend upserts by date.
#[async_trait]
pub trait HealthSubmitter: Send + Sync {
  async fn submit_daily(&self, records: &[DailyHealthMetrics]) -> Result<UpsertResponse, FetchError>;
}
