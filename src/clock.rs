//! Time source used by the cache, the health pipeline and the scheduler.

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, Offset, Utc};
use std::sync::Mutex;

/// Source of wall-clock time and the local calendar.
pub trait Clock: Send + Sync {
  /// Current instant in UTC.
  fn now(&self) -> DateTime<Utc>;

  /// Offset of the device's local time zone, used to cut calendar days.
  fn utc_offset(&self) -> FixedOffset;

  /// Current local calendar day.
  fn today(&self) -> NaiveDate {
    self.now().with_timezone(&self.utc_offset()).date_naive()
  }
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }

  fn utc_offset(&self) -> FixedOffset {
    *Local::now().offset()
  }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
  offset: FixedOffset,
}

impl ManualClock {
  /// Create a clock frozen at `now`, in UTC.
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
      offset: Utc.fix(),
    }
  }

  /// Use a fixed local offset (seconds east of UTC).
  pub fn with_offset(mut self, offset: FixedOffset) -> Self {
    self.offset = offset;
    self
  }

  pub fn set(&self, now: DateTime<Utc>) {
    *self.lock() = now;
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.lock();
    *now += by;
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
    self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.lock()
  }

  fn utc_offset(&self) -> FixedOffset {
    self.offset
  }
}

/// Inclusive range of local calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DayRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DayRange {
  /// Range from `start` to `end`; swapped bounds are reordered.
  pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
    if start <= end {
      Self { start, end }
    } else {
      Self {
        start: end,
        end: start,
      }
    }
  }

  pub fn single(day: NaiveDate) -> Self {
    Self {
      start: day,
      end: day,
    }
  }

  /// The `days` days ending on (and including) `end`.
  pub fn trailing(end: NaiveDate, days: u32) -> Self {
    let span = i64::from(days.max(1)) - 1;
    Self {
      start: end - Duration::days(span),
      end,
    }
  }

  pub fn contains(&self, day: NaiveDate) -> bool {
    self.start <= day && day <= self.end
  }

  pub fn day_count(&self) -> usize {
    ((self.end - self.start).num_days() + 1) as usize
  }

  pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
    let end = self.end;
    self.start.iter_days().take_while(move |day| *day <= end)
  }
}

impl std::fmt::Display for DayRange {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.start == self.end {
      write!(f, "{}", self.start.format("%Y-%m-%d"))
    } else {
      write!(
        f,
        "{}..{}",
        self.start.format("%Y-%m-%d"),
        self.end.format("%Y-%m-%d")
      )
    }
  }
}
