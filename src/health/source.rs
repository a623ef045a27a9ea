//! Device-side collaborators: the permission API and the health data store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;

use super::metrics::{MetricType, RawSample};

/// Status the device reports for one metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionStatus {
  Granted,
  Denied,
  Undetermined,
}

/// Device health permission API.
#[async_trait]
pub trait PermissionSource: Send + Sync {
  /// False when the device has no health data store at all.
  fn is_available(&self) -> bool;

  async fn authorization_status(&self, metric: MetricType) -> PermissionStatus;

  /// Show the system prompt. The outcome is deliberately not reported:
  /// platforms hide read grants, so callers must not treat this as a result.
  async fn request_authorization(&self, metrics: &[MetricType]);
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

/// Device health data store.
#[async_trait]
pub trait HealthDataSource: Send + Sync {
  /// Samples of `metric` overlapping `range`.
  ///
  /// An empty result is ambiguous: no data, or reads silently denied.
  async fn query_samples(&self, metric: MetricType, range: TimeRange) -> Result<Vec<RawSample>>;
}
