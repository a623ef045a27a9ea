//! Single-flight execution: at most one in-flight producer per key.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::FetchError;

/// Outcome handle shared by every subscriber of one in-flight request.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

tokio::task_local! {
  /// Keys whose producers are running on (or were spawned from) the current task.
  static PRODUCING: Arc<HashSet<String>>;
}

struct InFlight<T> {
  id: u64,
  future: SharedFetch<T>,
  subscribers: usize,
}

type InFlightMap<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

/// Collapses concurrent requests for the same key into one producer call.
///
/// The producer runs on its own task, so it completes even when every caller
/// that was waiting on it has been cancelled. The in-flight entry is removed
/// as soon as the producer settles; later calls start a fresh request rather
/// than replaying the previous outcome.
pub struct Deduplicator<T> {
  in_flight: InFlightMap<T>,
  next_id: AtomicU64,
}

impl<T> Default for Deduplicator<T> {
  fn default() -> Self {
    Self {
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_id: AtomicU64::new(0),
    }
  }
}

impl<T> Deduplicator<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `producer` for `key`, or join the request already in flight.
  ///
  /// Every subscriber receives the identical outcome. A producer that asks
  /// for its own key (directly or through nested deduplicated requests) gets
  /// [`FetchError::ReentrantRequest`] instead of waiting on itself forever.
  pub async fn run<F, Fut>(&self, key: &str, producer: F) -> Result<T, FetchError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    self.subscribe(key, producer)?.await
  }

  /// Register interest in `key` without awaiting the result.
  ///
  /// Registration is synchronous: once this returns, any other call for the
  /// same key joins the same request.
  pub fn subscribe<F, Fut>(&self, key: &str, producer: F) -> Result<SharedFetch<T>, FetchError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let chain = PRODUCING.try_with(Arc::clone).ok();
    if chain.as_ref().is_some_and(|keys| keys.contains(key)) {
      return Err(FetchError::ReentrantRequest {
        key: key.to_string(),
      });
    }

    let mut in_flight = lock(&self.in_flight);

    if let Some(entry) = in_flight.get_mut(key) {
      entry.subscribers += 1;
      debug!(key, subscribers = entry.subscribers, "joined in-flight request");
      return Ok(entry.future.clone());
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut keys: HashSet<String> = chain.map(|keys| (*keys).clone()).unwrap_or_default();
    keys.insert(key.to_string());

    let guard = SettleGuard {
      in_flight: Arc::clone(&self.in_flight),
      key: key.to_string(),
      id,
    };
    let handle = tokio::spawn(PRODUCING.scope(Arc::new(keys), async move {
      // Dropped on completion, panic or abort alike
      let _guard = guard;
      producer().await
    }));

    let future = async move {
      match handle.await {
        Ok(result) => result,
        Err(e) => Err(FetchError::Aborted(e.to_string())),
      }
    }
    .boxed()
    .shared();

    debug!(key, "started request");
    in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        future: future.clone(),
        subscribers: 1,
      },
    );

    Ok(future)
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    lock(&self.in_flight).contains_key(key)
  }

  /// Number of callers attached to the request for `key`, if any.
  pub fn subscribers(&self, key: &str) -> Option<usize> {
    lock(&self.in_flight).get(key).map(|entry| entry.subscribers)
  }

  pub fn in_flight_len(&self) -> usize {
    lock(&self.in_flight).len()
  }

  /// Forget every in-flight request. Running producers finish on their own,
  /// but later calls start fresh instead of joining them.
  pub fn clear(&self) {
    let mut in_flight = lock(&self.in_flight);
    if !in_flight.is_empty() {
      debug!(detached = in_flight.len(), "in-flight requests detached");
    }
    in_flight.clear();
  }
}

/// Clears the in-flight entry when the producer task ends.
struct SettleGuard<T> {
  in_flight: InFlightMap<T>,
  key: String,
  id: u64,
}

impl<T> Drop for SettleGuard<T> {
  fn drop(&mut self) {
    let mut in_flight = lock(&self.in_flight);
    // A newer request may already own the key
    if in_flight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
      in_flight.remove(&self.key);
      debug!(key = %self.key, "request settled");
    }
  }
}

fn lock<T>(map: &Mutex<HashMap<String, InFlight<T>>>) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
  map.lock().unwrap_or_else(|e| e.into_inner())
}
