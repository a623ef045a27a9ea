use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::api::{ApiClient, DataSource, HealthSubmitter};
use crate::cache::{ApiQueryKey, CacheEvent, CacheLayer, CacheResult, FreshnessCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::FetchError;
use crate::health::{HealthAuthorizer, HealthDataSource, HealthSyncPipeline, PermissionSource};
use crate::store::{KeyValueStore, SqliteStore};
use crate::sync::{PrefetchTask, SchedulerEvent, SyncScheduler, SyncTask, TriggerOutcome};

/// Collaborators the core runs against.
pub struct AppDeps {
  pub data_source: Arc<dyn DataSource>,
  pub submitter: Arc<dyn HealthSubmitter>,
  pub permissions: Arc<dyn PermissionSource>,
  pub health_data: Arc<dyn HealthDataSource>,
  pub store: Arc<dyn KeyValueStore>,
  pub clock: Arc<dyn Clock>,
}

impl AppDeps {
  /// Backend over HTTP, scalars in the default SQLite file, system time.
  ///
  /// The device-side health collaborators always come from the host.
  pub fn http(
    config: &Config,
    permissions: Arc<dyn PermissionSource>,
    health_data: Arc<dyn HealthDataSource>,
  ) -> Result<Self> {
    let client = Arc::new(ApiClient::from_config(&config.api)?);
    Ok(Self {
      data_source: client.clone(),
      submitter: client,
      permissions,
      health_data,
      store: Arc::new(SqliteStore::open()?),
      clock: Arc::new(SystemClock),
    })
  }
}

/// The sync core: one cache, one scheduler, built once per process.
pub struct App {
  config: Config,
  cache: CacheLayer<Value>,
  data_source: Arc<dyn DataSource>,
  scheduler: SyncScheduler,
}

impl App {
  pub fn new(config: Config, deps: AppDeps) -> Self {
    let cache = CacheLayer::new(Arc::new(FreshnessCache::new(
      config.cache.policy(),
      Arc::clone(&deps.clock),
    )));

    let prefetch: Arc<dyn SyncTask> = Arc::new(PrefetchTask::new(
      cache.clone(),
      Arc::clone(&deps.data_source),
      Arc::clone(&deps.clock),
    ));
    let pipeline = Arc::new(HealthSyncPipeline::new(
      deps.health_data,
      deps.submitter,
      Arc::clone(&deps.store),
      Arc::clone(&deps.clock),
      config.health.clone(),
    ));
    let authorizer = HealthAuthorizer::new(deps.permissions, config.health.metrics.clone());

    let scheduler = SyncScheduler::new(
      config.sync.interval(),
      authorizer,
      vec![prefetch],
      Some(pipeline),
      deps.store,
      deps.clock,
    );

    Self {
      config,
      cache,
      data_source: deps.data_source,
      scheduler,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &CacheLayer<Value> {
    &self.cache
  }

  pub fn scheduler(&self) -> &SyncScheduler {
    &self.scheduler
  }

  /// Read path for the UI: best value now, refreshed in the background when stale.
  pub async fn load(&self, key: &ApiQueryKey) -> Result<CacheResult<Value>, FetchError> {
    let source = Arc::clone(&self.data_source);
    let request = key.request();
    self
      .cache
      .load(key, move || async move { source.fetch(&request).await })
      .await
  }

  /// Cache keys updated or failed in the background; re-read with [`App::load`].
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.cache.subscribe()
  }

  pub fn scheduler_events(&self) -> broadcast::Receiver<SchedulerEvent> {
    self.scheduler.subscribe()
  }

  /// The host confirmed an authenticated session.
  pub fn sign_in(&self) {
    self.scheduler.start_session();
  }

  pub async fn on_app_launch(&self) -> TriggerOutcome {
    self.scheduler.on_app_launch().await
  }

  pub async fn on_foreground(&self) -> TriggerOutcome {
    self.scheduler.on_foreground().await
  }

  pub fn on_background(&self) {
    self.scheduler.on_background();
  }

  /// Stop syncing and forget everything cached for the previous user.
  pub fn sign_out(&self) {
    self.scheduler.sign_out();
    self.cache.clear();
  }

  pub fn shutdown(&self) {
    self.scheduler.cancel_periodic();
    info!("sync core shut down");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{ApiRequest, UpsertResponse};
  use crate::clock::ManualClock;
  use crate::health::{DailyHealthMetrics, MetricType, PermissionStatus, RawSample, TimeRange};
  use crate::store::MemoryStore;
  use async_trait::async_trait;
  use chrono::{NaiveDate, TimeZone, Utc};
  use serde_json::json;

  struct EchoSource;

  #[async_trait]
  impl DataSource for EchoSource {
    async fn fetch(&self, request: &ApiRequest) -> Result<Value, FetchError> {
      Ok(json!({ "endpoint": request.endpoint.name(), "params": request.params }))
    }
  }

  struct NoHealth;

  #[async_trait]
  impl PermissionSource for NoHealth {
    fn is_available(&self) -> bool {
      false
    }

    async fn authorization_status(&self, _metric: MetricType) -> PermissionStatus {
      PermissionStatus::Undetermined
    }

    async fn request_authorization(&self, _metrics: &[MetricType]) {}
  }

  #[async_trait]
  impl HealthDataSource for NoHealth {
    async fn query_samples(&self, _metric: MetricType, _range: TimeRange) -> Result<Vec<RawSample>> {
      Ok(Vec::new())
    }
  }

  #[async_trait]
  impl HealthSubmitter for NoHealth {
    async fn submit_daily(
      &self,
      _records: &[DailyHealthMetrics],
    ) -> Result<UpsertResponse, FetchError> {
      Err(FetchError::Network("unreachable".to_string()))
    }
  }

  fn app() -> App {
    App::new(
      Config::default(),
      AppDeps {
        data_source: Arc::new(EchoSource),
        submitter: Arc::new(NoHealth),
        permissions: Arc::new(NoHealth),
        health_data: Arc::new(NoHealth),
        store: Arc::new(MemoryStore::new()),
        clock: Arc::new(ManualClock::new(
          Utc.with_ymd_and_hms(2025, 12, 4, 9, 0, 0).unwrap(),
        )),
      },
    )
  }

  #[tokio::test]
  async fn test_load_then_sign_out_clears_cache() {
    let app = app();
    let key = ApiQueryKey::summary(NaiveDate::from_ymd_opt(2025, 12, 4).unwrap());

    let result = app.load(&key).await.unwrap();
    assert_eq!(result.data["params"]["date"], "2025-12-04");
    assert!(app.cache().get(&key).is_some());

    app.sign_out();
    assert!(app.cache().get(&key).is_none());
  }

  #[tokio::test]
  async fn test_unavailable_health_skips_pipeline() {
    let app = app();
    app.sign_in();

    let TriggerOutcome::Ran(report) = app.on_app_launch().await else {
      panic!("launch pass did not run");
    };
    assert!(report.is_success());
    assert_eq!(
      report.health,
      Some(crate::health::HealthSyncOutcome::Skipped(
        crate::health::SkipReason::Unavailable
      ))
    );
    app.shutdown();
  }
}
