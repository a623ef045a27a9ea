//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::dedup::Deduplicator;
use super::freshness::FreshnessCache;
use super::key::QueryKey;
use super::traits::{CacheResult, Freshness};
use crate::error::FetchError;

const EVENT_CAPACITY: usize = 64;

/// Notification emitted after the cache changes behind a caller's back.
///
/// Subscribers re-read the key themselves; the event carries no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// A fetch for `key` completed and the cache now holds the new value
  Updated { key: String },
  /// A fetch for `key` failed; any cached value was left untouched
  FetchFailed { key: String, error: FetchError },
}

/// Value paired with the time it was written to the cache.
type Stamped<V> = (V, DateTime<Utc>);

/// Stale-while-revalidate coordinator.
///
/// Sits between the presentation layer and the data source:
/// fresh entries are served directly, stale ones are served while a single
/// deduplicated refresh runs in the background, and misses wait on the
/// (shared) fetch.
pub struct CacheLayer<V> {
  cache: Arc<FreshnessCache<V>>,
  dedup: Arc<Deduplicator<Stamped<V>>>,
  events: broadcast::Sender<CacheEvent>,
}

impl<V> CacheLayer<V>
where
  V: Clone + Send + Sync + 'static,
{
  pub fn new(cache: Arc<FreshnessCache<V>>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      cache,
      dedup: Arc::new(Deduplicator::new()),
      events,
    }
  }

  pub fn cache(&self) -> &Arc<FreshnessCache<V>> {
    &self.cache
  }

  /// Listen for background updates and failures.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  /// Best value available now.
  ///
  /// 1. Fresh entry: returned as is, nothing fetched
  /// 2. Stale entry: returned immediately; one background refresh is started
  ///    (or joined) and a [`CacheEvent::Updated`] follows when it lands
  /// 3. Missing or expired: waits on the deduplicated fetch; failures are
  ///    returned and nothing is cached
  pub async fn load<K, F, Fut>(&self, key: &K, producer: F) -> Result<CacheResult<V>, FetchError>
  where
    K: QueryKey + ?Sized,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let key = key.cache_key();

    if let Some(cached) = self.cache.peek(&key) {
      match cached.freshness {
        Freshness::Fresh => {
          debug!(key = %key, "cache hit");
          return Ok(CacheResult::from_cache(cached.value, cached.stored_at, false));
        }
        Freshness::Stale => {
          debug!(key = %key, "serving stale entry, revalidating");
          self.revalidate(&key, producer);
          return Ok(CacheResult::from_cache(cached.value, cached.stored_at, true));
        }
        // peek never hands out expired entries
        Freshness::Expired => {}
      }
    }

    debug!(key = %key, "cache miss");
    let (value, stored_at) = self.dedup.run(&key, self.store_with(&key, producer)).await?;
    Ok(CacheResult::from_network(value, stored_at))
  }

  /// Fetch through the deduplicator regardless of freshness and store the result.
  pub async fn refresh<K, F, Fut>(&self, key: &K, producer: F) -> Result<CacheResult<V>, FetchError>
  where
    K: QueryKey + ?Sized,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let key = key.cache_key();
    let (value, stored_at) = self.dedup.run(&key, self.store_with(&key, producer)).await?;
    Ok(CacheResult::from_network(value, stored_at))
  }

  pub fn get<K: QueryKey + ?Sized>(&self, key: &K) -> Option<V> {
    self.cache.get(&key.cache_key())
  }

  pub fn invalidate<K: QueryKey + ?Sized>(&self, key: &K) -> bool {
    self.cache.invalidate(&key.cache_key())
  }

  /// Drop every entry and detach in-flight fetches. A fetch that started
  /// before this call neither writes its result nor emits an event.
  pub fn clear(&self) {
    self.cache.clear();
    self.dedup.clear();
  }

  pub fn is_refreshing<K: QueryKey + ?Sized>(&self, key: &K) -> bool {
    self.dedup.is_in_flight(&key.cache_key())
  }

  /// Start or join a refresh without waiting for it.
  fn revalidate<F, Fut>(&self, key: &str, producer: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    // The producer runs on its own task; dropping the handle only detaches us
    if let Err(e) = self.dedup.subscribe(key, self.store_with(key, producer)) {
      warn!(key = %key, error = %e, "could not start background refresh");
    }
  }

  /// Wrap `producer` so that the result is cached exactly once, by the
  /// producing task, before any subscriber sees it.
  fn store_with<F, Fut>(
    &self,
    key: &str,
    producer: F,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<Stamped<V>, FetchError>>
       + Send
       + 'static
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let cache = Arc::clone(&self.cache);
    let events = self.events.clone();
    let key = key.to_string();
    let epoch = cache.epoch();

    move || {
      async move {
        match producer().await {
          Ok(value) => {
            let Some(stored_at) = cache.set_in_epoch(&key, value.clone(), epoch) else {
              debug!(key = %key, "cache cleared during fetch, result dropped");
              return Err(FetchError::Aborted("cache cleared during fetch".to_string()));
            };
            debug!(key = %key, "cache updated");
            let _ = events.send(CacheEvent::Updated { key });
            Ok((value, stored_at))
          }
          Err(error) => {
            warn!(key = %key, error = %error, "fetch failed");
            let _ = events.send(CacheEvent::FetchFailed {
              key,
              error: error.clone(),
            });
            Err(error)
          }
        }
      }
      .boxed()
    }
  }
}

impl<V> Clone for CacheLayer<V> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      dedup: Arc::clone(&self.dedup),
      events: self.events.clone(),
    }
  }
}
