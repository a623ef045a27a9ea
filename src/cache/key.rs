//! Deterministic cache keys for backend queries.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::api::{ApiRequest, Endpoint};
use crate::clock::DayRange;

/// Trait for query descriptors that map onto cache keys.
pub trait QueryKey {
  /// Stable key; logically equivalent queries must produce the same string.
  fn cache_key(&self) -> String;

  /// Human-readable description for logs.
  fn description(&self) -> String;
}

/// Query key types for backend reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiQueryKey {
  /// AI-generated summary for one day
  DailySummary { date: NaiveDate },
  /// Calendar events within a day range
  CalendarEvents { range: DayRange },
  /// Health insights computed by the backend for a day range
  HealthInsights { range: DayRange },
  /// Anything else, keyed by endpoint and parameters
  Custom {
    endpoint: Endpoint,
    params: BTreeMap<String, String>,
  },
}

impl ApiQueryKey {
  pub fn summary(date: NaiveDate) -> Self {
    Self::DailySummary { date }
  }

  pub fn calendar(range: DayRange) -> Self {
    Self::CalendarEvents { range }
  }

  /// The request the data source should issue for this key.
  pub fn request(&self) -> ApiRequest {
    match self {
      Self::DailySummary { date } => {
        ApiRequest::new(Endpoint::DailySummary).param("date", format_day(*date))
      }
      Self::CalendarEvents { range } => range_request(Endpoint::CalendarEvents, range),
      Self::HealthInsights { range } => range_request(Endpoint::HealthInsights, range),
      Self::Custom { endpoint, params } => ApiRequest {
        endpoint: endpoint.clone(),
        params: params.clone(),
      },
    }
  }
}

impl QueryKey for ApiQueryKey {
  fn cache_key(&self) -> String {
    match self {
      Self::DailySummary { date } => format!("summary:{}", format_day(*date)),
      Self::CalendarEvents { range } => format!("calendar:{}", range),
      Self::HealthInsights { range } => format!("insights:{}", range),
      Self::Custom { endpoint, params } => {
        let name = endpoint.name().to_lowercase();
        if params.is_empty() {
          return name;
        }
        format!("{}:{}", name, params_digest(params))
      }
    }
  }

  fn description(&self) -> String {
    match self {
      Self::DailySummary { date } => format!("summary for {}", format_day(*date)),
      Self::CalendarEvents { range } => format!("calendar events {}", range),
      Self::HealthInsights { range } => format!("health insights {}", range),
      Self::Custom { endpoint, params } => {
        if params.is_empty() {
          endpoint.path()
        } else {
          format!("{} ({} params)", endpoint.path(), params.len())
        }
      }
    }
  }
}

impl QueryKey for str {
  fn cache_key(&self) -> String {
    self.to_string()
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn cache_key(&self) -> String {
    self.clone()
  }

  fn description(&self) -> String {
    self.clone()
  }
}

fn format_day(date: NaiveDate) -> String {
  date.format("%Y-%m-%d").to_string()
}

fn range_request(endpoint: Endpoint, range: &DayRange) -> ApiRequest {
  ApiRequest::new(endpoint)
    .param("start", format_day(range.start))
    .param("end", format_day(range.end))
}

/// SHA256 of the normalized parameters, shortened for readable keys.
fn params_digest(params: &BTreeMap<String, String>) -> String {
  let normalized: BTreeMap<String, &str> = params
    .iter()
    .map(|(key, value)| (key.trim().to_lowercase(), value.trim()))
    .collect();

  let mut hasher = Sha256::new();
  for (key, value) in normalized {
    hasher.update(key.as_bytes());
    hasher.update(b"=");
    hasher.update(value.as_bytes());
    hasher.update(b"&");
  }
  let digest = hasher.finalize();
  hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 12, d).unwrap()
  }

  #[test]
  fn test_summary_key() {
    assert_eq!(ApiQueryKey::summary(day(4)).cache_key(), "summary:2025-12-04");
  }

  #[test]
  fn test_swapped_range_yields_same_key() {
    let a = ApiQueryKey::calendar(DayRange::new(day(1), day(7)));
    let b = ApiQueryKey::calendar(DayRange::new(day(7), day(1)));
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key(), "calendar:2025-12-01..2025-12-07");
  }

  #[test]
  fn test_custom_params_are_order_and_whitespace_insensitive() {
    let mut first = BTreeMap::new();
    first.insert("Goal".to_string(), " sleep ".to_string());
    first.insert("week".to_string(), "49".to_string());

    let mut second = BTreeMap::new();
    second.insert("week".to_string(), "49".to_string());
    second.insert("goal".to_string(), "sleep".to_string());

    let endpoint = Endpoint::Other("api/v1/goals".to_string());
    let a = ApiQueryKey::Custom {
      endpoint: endpoint.clone(),
      params: first,
    };
    let b = ApiQueryKey::Custom {
      endpoint,
      params: second,
    };
    assert_eq!(a.cache_key(), b.cache_key());
    assert!(a.cache_key().starts_with("api/v1/goals:"));
  }

  #[test]
  fn test_request_carries_range_params() {
    let request = ApiQueryKey::calendar(DayRange::new(day(1), day(3))).request();
    assert_eq!(request.endpoint, Endpoint::CalendarEvents);
    assert_eq!(request.params.get("start").map(String::as_str), Some("2025-12-01"));
    assert_eq!(request.params.get("end").map(String::as_str), Some("2025-12-03"));
  }
}
