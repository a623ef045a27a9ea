//! Upstream work run by every sync pass before the health pipeline.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::api::DataSource;
use crate::cache::{ApiQueryKey, CacheLayer, QueryKey};
use crate::clock::{Clock, DayRange};
use crate::error::FetchError;

/// One unit of upstream work in a sync pass.
#[async_trait]
pub trait SyncTask: Send + Sync {
  fn name(&self) -> &str;

  async fn run(&self) -> Result<(), FetchError>;
}

/// Refreshes the entities the app opens on, so the first screen is warm.
///
/// A key the backend rejected with a permanent client error is not asked
/// for again until the key itself changes (e.g. the next day).
pub struct PrefetchTask {
  cache: CacheLayer<Value>,
  source: Arc<dyn DataSource>,
  clock: Arc<dyn Clock>,
  rejected: Mutex<HashSet<String>>,
}

impl PrefetchTask {
  pub fn new(cache: CacheLayer<Value>, source: Arc<dyn DataSource>, clock: Arc<dyn Clock>) -> Self {
    Self {
      cache,
      source,
      clock,
      rejected: Mutex::new(HashSet::new()),
    }
  }

  /// Keys refreshed on each pass.
  pub fn keys(&self) -> Vec<ApiQueryKey> {
    let today = self.clock.today();
    vec![
      ApiQueryKey::summary(today),
      ApiQueryKey::calendar(DayRange::single(today)),
    ]
  }
}

#[async_trait]
impl SyncTask for PrefetchTask {
  fn name(&self) -> &str {
    "prefetch"
  }

  /// Refresh every key even if one fails. An auth failure wins over any
  /// other error so the scheduler can hand it to the session layer.
  async fn run(&self) -> Result<(), FetchError> {
    let mut failure: Option<FetchError> = None;
    let keys = self.keys();
    let skipped: HashSet<String> = {
      let mut rejected = self.rejected.lock().unwrap_or_else(|e| e.into_inner());
      rejected.retain(|cached| keys.iter().any(|key| key.cache_key() == *cached));
      rejected.clone()
    };

    for key in keys {
      if skipped.contains(&key.cache_key()) {
        debug!(key = %key.cache_key(), "skipping rejected request");
        continue;
      }

      let source = Arc::clone(&self.source);
      let request = key.request();
      let result = self
        .cache
        .refresh(&key, move || async move { source.fetch(&request).await })
        .await;

      match result {
        Ok(_) => debug!(key = %key.cache_key(), "prefetched"),
        Err(e) => {
          warn!(key = %key.description(), error = %e, "prefetch failed");
          if e.is_permanent() {
            self
              .rejected
              .lock()
              .unwrap_or_else(|e| e.into_inner())
              .insert(key.cache_key());
          }
          if failure.as_ref().map_or(true, |f| !f.is_auth()) {
            failure = Some(e);
          }
        }
      }
    }

    failure.map_or(Ok(()), Err)
  }
}
