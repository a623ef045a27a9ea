//! Health authorization and the daily metrics sync pipeline.

mod authorization;
mod metrics;
mod pipeline;
mod source;

pub use authorization::{HealthAuthorizationState, HealthAuthorizer};
pub use metrics::{
  aggregate_days, DailyHealthMetrics, MetricType, RawSample, SampleValue, SleepStage,
};
pub use pipeline::{HealthSyncOutcome, HealthSyncPipeline, SkipReason};
pub use source::{HealthDataSource, PermissionSource, PermissionStatus, TimeRange};
