//! Incremental health sync: read device samples, aggregate per day, upsert.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::authorization::HealthAuthorizationState;
use super::metrics::{aggregate_days, DailyHealthMetrics};
use super::source::{HealthDataSource, TimeRange};
use crate::api::HealthSubmitter;
use crate::clock::{Clock, DayRange};
use crate::config::HealthConfig;
use crate::error::{FetchError, SyncError};
use crate::store::{KeyValueStore, LAST_HEALTH_SYNC_DATE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSyncOutcome {
  /// Records for `range` were accepted by the backend
  Submitted {
    range: DayRange,
    records: usize,
    upserted: u32,
  },
  Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// No health store on this device
  Unavailable,
  /// Every type denied; waits for the user to change settings
  Denied,
  /// Same payload the backend already rejected as invalid
  RejectedPayloadUnchanged,
}

pub struct HealthSyncPipeline {
  health_data: Arc<dyn HealthDataSource>,
  submitter: Arc<dyn HealthSubmitter>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  config: HealthConfig,
  /// Digest of the last payload refused with a permanent client error
  rejected_digest: Mutex<Option<String>>,
}

impl HealthSyncPipeline {
  pub fn new(
    health_data: Arc<dyn HealthDataSource>,
    submitter: Arc<dyn HealthSubmitter>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
  ) -> Self {
    Self {
      health_data,
      submitter,
      store,
      clock,
      config,
      rejected_digest: Mutex::new(None),
    }
  }

  pub fn last_sync_date(&self) -> Result<Option<NaiveDate>, SyncError> {
    self
      .store
      .get_date(LAST_HEALTH_SYNC_DATE)
      .map_err(SyncError::store)
  }

  /// Days the next pass covers.
  ///
  /// The first sync covers the trailing `initial_sync_days`; later ones run
  /// from the last confirmed day through today. The last day is always
  /// re-sent because its totals keep growing until midnight.
  pub fn sync_range(&self) -> Result<DayRange, SyncError> {
    let today = self.clock.today();
    let range = match self.last_sync_date()? {
      None => DayRange::trailing(today, self.config.initial_sync_days),
      Some(last) if last >= today => DayRange::single(today),
      Some(last) => DayRange::new(last, today),
    };
    Ok(range)
  }

  /// Read and aggregate every configured metric over `range`.
  ///
  /// A failed read is logged and treated like an empty one: reads are
  /// optimistic, and empty never means denied.
  pub async fn collect(&self, range: DayRange) -> Vec<DailyHealthMetrics> {
    let offset = self.clock.utc_offset();
    let window = TimeRange {
      start: local_midnight(range.start, offset),
      end: local_midnight(range.end, offset) + Duration::days(1),
    };

    let mut samples = BTreeMap::new();
    for metric in &self.config.metrics {
      match self.health_data.query_samples(*metric, window).await {
        Ok(found) => {
          debug!(?metric, samples = found.len(), "read health samples");
          samples.insert(*metric, found);
        }
        Err(e) => warn!(?metric, error = %e, "health query failed, treating as no data"),
      }
    }

    aggregate_days(range.days(), &samples, offset)
  }

  /// Run one sync; `last_sync_date` advances only after the backend confirms.
  pub async fn sync(
    &self,
    authorization: &HealthAuthorizationState,
  ) -> Result<HealthSyncOutcome, SyncError> {
    match authorization {
      HealthAuthorizationState::Unavailable => {
        return Ok(HealthSyncOutcome::Skipped(SkipReason::Unavailable))
      }
      HealthAuthorizationState::Denied => {
        info!("health access denied for every type, skipping");
        return Ok(HealthSyncOutcome::Skipped(SkipReason::Denied));
      }
      _ => {}
    }

    let range = self.sync_range()?;
    let records = self.collect(range).await;
    let digest = payload_digest(&records)?;

    if self.rejected().as_deref() == Some(digest.as_str()) {
      warn!(%range, "payload unchanged since the backend rejected it, not resending");
      return Ok(HealthSyncOutcome::Skipped(SkipReason::RejectedPayloadUnchanged));
    }

    info!(%range, records = records.len(), "submitting daily health metrics");
    match self.submitter.submit_daily(&records).await {
      Ok(response) => {
        if (response.records_upserted as usize) < records.len() {
          warn!(
            sent = records.len(),
            upserted = response.records_upserted,
            status = %response.status,
            "backend upserted fewer records than sent"
          );
        }
        *self.rejected_guard() = None;
        self
          .store
          .set_date(LAST_HEALTH_SYNC_DATE, range.end)
          .map_err(SyncError::store)?;
        Ok(HealthSyncOutcome::Submitted {
          range,
          records: records.len(),
          upserted: response.records_upserted,
        })
      }
      Err(e) => {
        if e.is_permanent() {
          error!(%range, error = %e, "backend rejected health payload");
          *self.rejected_guard() = Some(digest);
        }
        Err(e.into())
      }
    }
  }

  fn rejected(&self) -> Option<String> {
    self.rejected_guard().clone()
  }

  fn rejected_guard(&self) -> std::sync::MutexGuard<'_, Option<String>> {
    self.rejected_digest.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn local_midnight(day: NaiveDate, offset: chrono::FixedOffset) -> DateTime<Utc> {
  Utc.from_utc_datetime(&(day.and_time(NaiveTime::default()) - offset))
}

fn payload_digest(records: &[DailyHealthMetrics]) -> Result<String, FetchError> {
  let body = serde_json::to_vec(records).map_err(|e| FetchError::Decode(e.to_string()))?;
  Ok(hex::encode(Sha256::digest(&body)))
}
