//! Core types describing cached values and where they came from.

use chrono::{DateTime, Duration, Utc};

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was stored
  pub stored_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from data that was just fetched.
  pub fn from_network(data: T, stored_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      stored_at,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, stored_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      stored_at,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::CacheStale
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched by this call (or by the in-flight request it joined)
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its fresh window; a background refresh was started
  CacheStale,
}

/// Freshness classification of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Serve without refreshing
  Fresh,
  /// Serve, but refresh in the background
  Stale,
  /// Too old to serve
  Expired,
}

/// TTL thresholds used to classify entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
  pub fresh_ttl: Duration,
  pub stale_ttl: Duration,
  /// Entries older than this are evicted. Never shorter than `stale_ttl`.
  pub max_age: Duration,
}

impl FreshnessPolicy {
  pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
    Self {
      fresh_ttl,
      stale_ttl,
      max_age: stale_ttl,
    }
  }

  /// Keep serving stale entries up to `max_age` instead of `stale_ttl`.
  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age.max(self.stale_ttl);
    self
  }

  /// Pure classification of an entry's age.
  pub fn classify(&self, age: Duration) -> Freshness {
    if age < self.fresh_ttl {
      Freshness::Fresh
    } else if age <= self.max_age {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }
}

impl Default for FreshnessPolicy {
  fn default() -> Self {
    Self::new(Duration::seconds(60), Duration::seconds(300))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classify_default_policy() {
    let policy = FreshnessPolicy::default();
    assert_eq!(policy.classify(Duration::seconds(0)), Freshness::Fresh);
    assert_eq!(policy.classify(Duration::seconds(59)), Freshness::Fresh);
    assert_eq!(policy.classify(Duration::seconds(60)), Freshness::Stale);
    assert_eq!(policy.classify(Duration::seconds(300)), Freshness::Stale);
    assert_eq!(policy.classify(Duration::seconds(301)), Freshness::Expired);
  }

  #[test]
  fn test_max_age_extends_stale_window() {
    let policy = FreshnessPolicy::default().with_max_age(Duration::hours(1));
    assert_eq!(policy.classify(Duration::seconds(400)), Freshness::Stale);
    assert_eq!(policy.classify(Duration::hours(2)), Freshness::Expired);
  }

  #[test]
  fn test_max_age_never_below_stale_ttl() {
    let policy = FreshnessPolicy::default().with_max_age(Duration::seconds(10));
    assert_eq!(policy.max_age, Duration::seconds(300));
  }
}
