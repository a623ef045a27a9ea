//! In-memory keyed store with TTL-based staleness classification.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::traits::{Freshness, FreshnessPolicy};
use crate::clock::Clock;

/// A stored value and the moment it was stored. Replaced wholesale on refresh.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
  value: V,
  stored_at: DateTime<Utc>,
}

/// Snapshot of an entry taken under a single lock.
#[derive(Debug, Clone)]
pub struct CachedValue<V> {
  pub value: V,
  pub stored_at: DateTime<Utc>,
  pub freshness: Freshness,
}

/// Process-wide cache of values keyed by request.
///
/// All access goes through one mutex that is never held across an await,
/// so concurrent tasks observe each key mutation atomically.
pub struct FreshnessCache<V> {
  entries: Mutex<HashMap<String, CacheEntry<V>>>,
  /// Bumped by `clear`, only while the entries lock is held
  epoch: AtomicU64,
  policy: FreshnessPolicy,
  clock: Arc<dyn Clock>,
}

impl<V: Clone> FreshnessCache<V> {
  pub fn new(policy: FreshnessPolicy, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      epoch: AtomicU64::new(0),
      policy,
      clock,
    }
  }

  pub fn policy(&self) -> FreshnessPolicy {
    self.policy
  }

  /// Value for `key` regardless of freshness, unless past the eviction ceiling.
  pub fn get(&self, key: &str) -> Option<V> {
    self.peek(key).map(|cached| cached.value)
  }

  /// Value, timestamp and classification for `key`.
  ///
  /// Expired entries are evicted on the way out.
  pub fn peek(&self, key: &str) -> Option<CachedValue<V>> {
    let now = self.clock.now();
    let mut entries = self.entries();

    let freshness = {
      let entry = entries.get(key)?;
      self.policy.classify(now - entry.stored_at)
    };

    if freshness == Freshness::Expired {
      debug!(key, "evicting expired cache entry");
      entries.remove(key);
      return None;
    }

    entries.get(key).map(|entry| CachedValue {
      value: entry.value.clone(),
      stored_at: entry.stored_at,
      freshness,
    })
  }

  /// Store `value`, replacing any existing entry. Returns the timestamp used.
  pub fn set(&self, key: &str, value: V) -> DateTime<Utc> {
    let stored_at = self.clock.now();
    self
      .entries()
      .insert(key.to_string(), CacheEntry { value, stored_at });
    stored_at
  }

  /// Store `value` only if the cache has not been cleared since `epoch`
  /// was read. Returns `None` when the write was discarded.
  pub fn set_in_epoch(&self, key: &str, value: V, epoch: u64) -> Option<DateTime<Utc>> {
    let mut entries = self.entries();
    if self.epoch.load(Ordering::SeqCst) != epoch {
      return None;
    }
    let stored_at = self.clock.now();
    entries.insert(key.to_string(), CacheEntry { value, stored_at });
    Some(stored_at)
  }

  /// Generation of the cache contents; changes on every `clear`.
  pub fn epoch(&self) -> u64 {
    self.epoch.load(Ordering::SeqCst)
  }

  pub fn is_fresh(&self, key: &str) -> bool {
    self.freshness(key) == Some(Freshness::Fresh)
  }

  /// True when the entry is absent, expired, or past its fresh window.
  pub fn needs_refresh(&self, key: &str) -> bool {
    !self.is_fresh(key)
  }

  /// Classification of `key` without touching the entry.
  pub fn freshness(&self, key: &str) -> Option<Freshness> {
    let now = self.clock.now();
    self
      .entries()
      .get(key)
      .map(|entry| self.policy.classify(now - entry.stored_at))
  }

  pub fn invalidate(&self, key: &str) -> bool {
    self.entries().remove(key).is_some()
  }

  /// Drop every entry, e.g. on sign-out.
  pub fn clear(&self) {
    let mut entries = self.entries();
    entries.clear();
    self.epoch.fetch_add(1, Ordering::SeqCst);
  }

  /// Remove all expired entries, returning how many were dropped.
  pub fn purge_expired(&self) -> usize {
    let now = self.clock.now();
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, entry| self.policy.classify(now - entry.stored_at) != Freshness::Expired);
    before - entries.len()
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
    // A panic while holding the lock cannot leave a half-written entry
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}
