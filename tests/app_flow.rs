use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};

use insight_sync::api::{ApiRequest, DataSource, HealthSubmitter, UpsertResponse};
use insight_sync::cache::{ApiQueryKey, CacheEvent, CacheSource, QueryKey};
use insight_sync::clock::ManualClock;
use insight_sync::health::{
  DailyHealthMetrics, HealthAuthorizationState, HealthDataSource, HealthSyncOutcome, MetricType,
  PermissionSource, PermissionStatus, RawSample, TimeRange,
};
use insight_sync::store::{KeyValueStore, MemoryStore, LAST_HEALTH_SYNC_DATE, LAST_SYNC_COMPLETED_AT};
use insight_sync::sync::{SchedulerEvent, TriggerOutcome};
use insight_sync::{App, AppDeps, Config, FetchError};

struct CountingSource {
  calls: AtomicUsize,
}

#[async_trait]
impl DataSource for CountingSource {
  async fn fetch(&self, request: &ApiRequest) -> Result<Value, FetchError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::task::yield_now().await;
    Ok(json!({ "endpoint": request.endpoint.name(), "call": call }))
  }
}

struct FakePermissions {
  statuses: BTreeMap<MetricType, PermissionStatus>,
}

#[async_trait]
impl PermissionSource for FakePermissions {
  fn is_available(&self) -> bool {
    true
  }

  async fn authorization_status(&self, metric: MetricType) -> PermissionStatus {
    self
      .statuses
      .get(&metric)
      .copied()
      .unwrap_or(PermissionStatus::Undetermined)
  }

  async fn request_authorization(&self, _metrics: &[MetricType]) {}
}

/// 4000 steps every morning at 08:00 UTC.
struct DailySteps;

#[async_trait]
impl HealthDataSource for DailySteps {
  async fn query_samples(
    &self,
    metric: MetricType,
    range: TimeRange,
  ) -> color_eyre::Result<Vec<RawSample>> {
    if metric != MetricType::Steps {
      return Ok(Vec::new());
    }
    let mut samples = Vec::new();
    let mut day = range.start.date_naive();
    while day <= range.end.date_naive() {
      let start = Utc.from_utc_datetime(&day.and_hms_opt(8, 0, 0).unwrap());
      if start >= range.start && start < range.end {
        samples.push(RawSample::quantity(start, start + Duration::hours(1), 4000.0));
      }
      day = day.succ_opt().unwrap();
    }
    Ok(samples)
  }
}

#[derive(Default)]
struct RecordingSubmitter {
  failures: Mutex<VecDeque<FetchError>>,
  submissions: Mutex<Vec<Vec<DailyHealthMetrics>>>,
}

impl RecordingSubmitter {
  fn fail_next(&self, error: FetchError) {
    self.failures.lock().unwrap().push_back(error);
  }

  fn submissions(&self) -> Vec<Vec<DailyHealthMetrics>> {
    self.submissions.lock().unwrap().clone()
  }
}

#[async_trait]
impl HealthSubmitter for RecordingSubmitter {
  async fn submit_daily(&self, records: &[DailyHealthMetrics]) -> Result<UpsertResponse, FetchError> {
    if let Some(error) = self.failures.lock().unwrap().pop_front() {
      return Err(error);
    }
    self.submissions.lock().unwrap().push(records.to_vec());
    Ok(UpsertResponse {
      status: "ok".to_string(),
      records_upserted: records.len() as u32,
    })
  }
}

struct Harness {
  app: App,
  clock: Arc<ManualClock>,
  source: Arc<CountingSource>,
  submitter: Arc<RecordingSubmitter>,
  store: Arc<MemoryStore>,
}

fn start() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 12, 4, 12, 0, 0).unwrap()
}

fn date(day: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(2025, 12, day).unwrap()
}

fn harness() -> Harness {
  let config = Config::from_yaml(
    "cache:\n  fresh_ttl_secs: 60\n  stale_ttl_secs: 300\nhealth:\n  metrics: [steps, sleep, heart_rate_variability]\n",
  )
  .unwrap();

  let clock = Arc::new(ManualClock::new(start()));
  let source = Arc::new(CountingSource {
    calls: AtomicUsize::new(0),
  });
  let submitter = Arc::new(RecordingSubmitter::default());
  let store = Arc::new(MemoryStore::new());
  let permissions = Arc::new(FakePermissions {
    statuses: [
      (MetricType::Steps, PermissionStatus::Denied),
      (MetricType::Sleep, PermissionStatus::Granted),
      (MetricType::HeartRateVariability, PermissionStatus::Undetermined),
    ]
    .into_iter()
    .collect(),
  });

  let app = App::new(
    config,
    AppDeps {
      data_source: source.clone(),
      submitter: submitter.clone(),
      permissions,
      health_data: Arc::new(DailySteps),
      store: store.clone(),
      clock: clock.clone(),
    },
  );

  Harness {
    app,
    clock,
    source,
    submitter,
    store,
  }
}

#[tokio::test]
async fn test_cold_key_simultaneous_loads_share_one_fetch() {
  let h = harness();
  let key = ApiQueryKey::summary(date(4));
  assert_eq!(key.cache_key(), "summary:2025-12-04");

  let (first, second) = tokio::join!(h.app.load(&key), h.app.load(&key));
  let (first, second) = (first.unwrap(), second.unwrap());

  assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
  assert_eq!(first.data, second.data);
  assert_eq!(first.source, CacheSource::Network);
}

#[tokio::test]
async fn test_stale_entry_is_served_then_refreshed_in_background() {
  let h = harness();
  let key = ApiQueryKey::summary(date(4));
  let mut events = h.app.subscribe();

  h.app.load(&key).await.unwrap();
  assert_eq!(
    events.recv().await.unwrap(),
    CacheEvent::Updated {
      key: key.cache_key()
    }
  );

  h.clock.advance(Duration::seconds(90));
  let stale = h.app.load(&key).await.unwrap();
  assert_eq!(stale.source, CacheSource::CacheStale);
  assert_eq!(stale.data["call"], 1);

  // The refresh lands without anyone awaiting it
  assert_eq!(
    events.recv().await.unwrap(),
    CacheEvent::Updated {
      key: key.cache_key()
    }
  );
  let fresh = h.app.load(&key).await.unwrap();
  assert_eq!(fresh.source, CacheSource::CacheFresh);
  assert_eq!(fresh.data["call"], 2);

  // Past the stale window nothing is served from cache
  h.clock.advance(Duration::seconds(400));
  let refetched = h.app.load(&key).await.unwrap();
  assert_eq!(refetched.source, CacheSource::Network);
  assert_eq!(h.source.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_launch_and_foreground_sync_health_incrementally() {
  let h = harness();
  h.app.sign_in();
  let mut events = h.app.scheduler_events();

  let TriggerOutcome::Ran(report) = h.app.on_app_launch().await else {
    panic!("launch pass did not run");
  };

  let missing: BTreeSet<_> = [MetricType::Steps, MetricType::HeartRateVariability]
    .into_iter()
    .collect();
  assert_eq!(
    report.authorization,
    HealthAuthorizationState::PartiallyAuthorized { missing }
  );
  assert!(report.is_success(), "{:?}", report);
  assert!(matches!(
    report.health,
    Some(HealthSyncOutcome::Submitted { records: 14, .. })
  ));

  // Steps were reported denied but reads are optimistic
  let first = &h.submitter.submissions()[0];
  assert_eq!(first.len(), 14);
  assert!(first.iter().all(|r| r.steps == Some(4000)));
  assert_eq!(h.store.get_date(LAST_HEALTH_SYNC_DATE).unwrap(), Some(date(4)));
  assert_eq!(
    h.store.get_timestamp(LAST_SYNC_COMPLETED_AT).unwrap(),
    Some(start())
  );

  // Prefetch warmed today's summary
  assert!(h.app.cache().get(&ApiQueryKey::summary(date(4))).is_some());

  // Next day: only [last sync, today] goes out
  h.clock.advance(Duration::days(1));
  let TriggerOutcome::Ran(report) = h.app.on_foreground().await else {
    panic!("foreground pass did not run");
  };
  assert!(report.is_success());
  let dates: Vec<_> = h.submitter.submissions()[1].iter().map(|r| r.date).collect();
  assert_eq!(dates, vec![date(4), date(5)]);
  assert_eq!(h.store.get_date(LAST_HEALTH_SYNC_DATE).unwrap(), Some(date(5)));
  assert!(h.app.scheduler().is_periodic_running());

  h.app.on_background();
  assert!(!h.app.scheduler().is_periodic_running());

  let mut completed = 0;
  while let Ok(event) = events.try_recv() {
    if matches!(event, SchedulerEvent::PassCompleted(_)) {
      completed += 1;
    }
  }
  assert_eq!(completed, 2);
  h.app.shutdown();
}

#[tokio::test]
async fn test_failed_submission_is_retried_on_next_trigger() {
  let h = harness();
  h.app.sign_in();
  h.store.set_date(LAST_HEALTH_SYNC_DATE, date(2)).unwrap();
  h.submitter
    .fail_next(FetchError::Network("timed out".to_string()));

  let TriggerOutcome::Ran(report) = h.app.on_app_launch().await else {
    panic!("launch pass did not run");
  };
  assert!(!report.is_success());
  assert_eq!(h.store.get_date(LAST_HEALTH_SYNC_DATE).unwrap(), Some(date(2)));
  assert_eq!(h.store.get_timestamp(LAST_SYNC_COMPLETED_AT).unwrap(), None);

  let TriggerOutcome::Ran(report) = h.app.on_foreground().await else {
    panic!("foreground pass did not run");
  };
  assert!(report.is_success());
  let dates: Vec<_> = h.submitter.submissions()[0].iter().map(|r| r.date).collect();
  assert_eq!(dates, vec![date(2), date(3), date(4)]);
  assert_eq!(h.store.get_date(LAST_HEALTH_SYNC_DATE).unwrap(), Some(date(4)));
  h.app.shutdown();
}

#[tokio::test]
async fn test_rejected_credentials_stop_sync_until_sign_in() {
  let h = harness();
  h.app.sign_in();
  let mut events = h.app.scheduler_events();
  h.submitter.fail_next(FetchError::Auth("token expired".to_string()));

  let TriggerOutcome::Ran(report) = h.app.on_foreground().await else {
    panic!("foreground pass did not run");
  };
  assert!(report.authentication_required);
  assert!(!h.app.scheduler().is_periodic_running());

  let mut auth_required = false;
  while let Ok(event) = events.try_recv() {
    auth_required |= event == SchedulerEvent::AuthenticationRequired;
  }
  assert!(auth_required);
  assert!(matches!(h.app.on_foreground().await, TriggerOutcome::Skipped(_)));

  h.app.sign_in();
  assert!(matches!(h.app.on_foreground().await, TriggerOutcome::Ran(_)));
  assert_eq!(h.submitter.submissions().len(), 1);
  h.app.shutdown();
}
