//! Metric types, raw device samples and per-day aggregation.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health data types the pipeline reads from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
  Steps,
  ActiveEnergy,
  ExerciseMinutes,
  StandMinutes,
  RestingHeartRate,
  HeartRateVariability,
  Sleep,
  Workouts,
}

impl MetricType {
  pub const ALL: [MetricType; 8] = [
    MetricType::Steps,
    MetricType::ActiveEnergy,
    MetricType::ExerciseMinutes,
    MetricType::StandMinutes,
    MetricType::RestingHeartRate,
    MetricType::HeartRateVariability,
    MetricType::Sleep,
    MetricType::Workouts,
  ];

  pub fn all() -> Vec<MetricType> {
    Self::ALL.to_vec()
  }

  /// Local day a sample counts towards.
  ///
  /// Sleep belongs to the morning it ends on; everything else to the day it starts.
  pub fn bucket_day(&self, sample: &RawSample, offset: FixedOffset) -> NaiveDate {
    let at = match self {
      MetricType::Sleep => sample.end,
      _ => sample.start,
    };
    at.with_timezone(&offset).date_naive()
  }
}

/// Stage reported by a sleep analysis sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStage {
  InBed,
  Awake,
  Asleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleValue {
  /// Numeric reading in the metric's unit (count, kcal, minutes, bpm, ms)
  Quantity(f64),
  Sleep(SleepStage),
  /// A workout session; only its existence matters here
  Workout,
}

/// One sample as reported by the device health store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
  pub value: SampleValue,
}

impl RawSample {
  pub fn quantity(start: DateTime<Utc>, end: DateTime<Utc>, value: f64) -> Self {
    Self {
      start,
      end,
      value: SampleValue::Quantity(value),
    }
  }

  fn minutes(&self) -> f64 {
    (self.end - self.start).num_seconds().max(0) as f64 / 60.0
  }
}

/// One day of aggregated metrics, upserted by `date` on the backend.
///
/// Every metric is optional: `None` means the device had no samples for that
/// day, which the backend keeps distinct from "never synced".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyHealthMetrics {
  pub date: NaiveDate,
  pub steps: Option<u32>,
  pub active_minutes: Option<u32>,
  pub stand_minutes: Option<u32>,
  pub active_energy_burned: Option<f64>,
  pub resting_heart_rate: Option<f64>,
  pub hrv: Option<f64>,
  pub sleep_minutes: Option<u32>,
  pub sleep_quality_score: Option<u8>,
  pub workouts_count: Option<u32>,
}

impl DailyHealthMetrics {
  pub fn empty(date: NaiveDate) -> Self {
    Self {
      date,
      steps: None,
      active_minutes: None,
      stand_minutes: None,
      active_energy_burned: None,
      resting_heart_rate: None,
      hrv: None,
      sleep_minutes: None,
      sleep_quality_score: None,
      workouts_count: None,
    }
  }

  pub fn has_data(&self) -> bool {
    *self != Self::empty(self.date)
  }

  /// Fold one metric's samples for this day into the record.
  pub fn apply(&mut self, metric: MetricType, samples: &[RawSample]) {
    if samples.is_empty() {
      return;
    }

    match metric {
      MetricType::Steps => self.steps = sum_quantities(samples).map(round_u32),
      MetricType::ActiveEnergy => self.active_energy_burned = sum_quantities(samples),
      MetricType::ExerciseMinutes => self.active_minutes = sum_quantities(samples).map(round_u32),
      MetricType::StandMinutes => self.stand_minutes = sum_quantities(samples).map(round_u32),
      MetricType::RestingHeartRate => self.resting_heart_rate = mean_quantities(samples),
      MetricType::HeartRateVariability => self.hrv = mean_quantities(samples),
      MetricType::Sleep => {
        // In-bed or awake time alone is not a night of sleep
        let has_sleep = samples
          .iter()
          .any(|s| matches!(s.value, SampleValue::Sleep(SleepStage::Asleep)));
        let (asleep, in_bed) = sleep_minutes(samples);
        if has_sleep && in_bed > 0.0 {
          self.sleep_minutes = Some(round_u32(asleep));
          let score = (asleep / in_bed * 100.0).round().clamp(0.0, 100.0);
          self.sleep_quality_score = Some(score as u8);
        }
      }
      MetricType::Workouts => {
        let count = samples
          .iter()
          .filter(|s| matches!(s.value, SampleValue::Workout))
          .count();
        if count > 0 {
          self.workouts_count = Some(count as u32);
        }
      }
    }
  }
}

/// One record per day in `days`, including days without any samples.
pub fn aggregate_days(
  days: impl IntoIterator<Item = NaiveDate>,
  samples: &BTreeMap<MetricType, Vec<RawSample>>,
  offset: FixedOffset,
) -> Vec<DailyHealthMetrics> {
  let mut records: BTreeMap<NaiveDate, DailyHealthMetrics> = days
    .into_iter()
    .map(|day| (day, DailyHealthMetrics::empty(day)))
    .collect();

  for (metric, metric_samples) in samples {
    let mut by_day: BTreeMap<NaiveDate, Vec<RawSample>> = BTreeMap::new();
    for sample in metric_samples {
      let day = metric.bucket_day(sample, offset);
      if records.contains_key(&day) {
        by_day.entry(day).or_default().push(sample.clone());
      }
    }
    for (day, day_samples) in by_day {
      if let Some(record) = records.get_mut(&day) {
        record.apply(*metric, &day_samples);
      }
    }
  }

  records.into_values().collect()
}

fn quantities(samples: &[RawSample]) -> impl Iterator<Item = f64> + '_ {
  samples.iter().filter_map(|s| match s.value {
    SampleValue::Quantity(v) if v.is_finite() => Some(v),
    _ => None,
  })
}

fn sum_quantities(samples: &[RawSample]) -> Option<f64> {
  let mut seen = false;
  let total: f64 = quantities(samples).inspect(|_| seen = true).sum();
  seen.then_some(total)
}

fn mean_quantities(samples: &[RawSample]) -> Option<f64> {
  let (sum, count) = quantities(samples).fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
  (count > 0).then(|| sum / count as f64)
}

/// Minutes asleep and minutes in bed (asleep included).
fn sleep_minutes(samples: &[RawSample]) -> (f64, f64) {
  samples.iter().fold((0.0, 0.0), |(asleep, in_bed), s| match s.value {
    SampleValue::Sleep(SleepStage::Asleep) => (asleep + s.minutes(), in_bed + s.minutes()),
    SampleValue::Sleep(SleepStage::Awake | SleepStage::InBed) => (asleep, in_bed + s.minutes()),
    _ => (asleep, in_bed),
  })
}

fn round_u32(v: f64) -> u32 {
  v.round().clamp(0.0, u32::MAX as f64) as u32
}
