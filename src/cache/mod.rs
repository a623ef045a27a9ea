//! Freshness-aware caching for backend reads.
//!
//! This module provides a data-source-agnostic caching mechanism that:
//! - Keeps values in memory with fresh/stale/expired classification
//! - Collapses concurrent fetches of the same key into one request
//! - Serves stale values while a single refresh runs in the background
//! - Notifies subscribers when a background refresh lands

mod dedup;
mod freshness;
mod key;
mod layer;
mod traits;

pub use dedup::{Deduplicator, SharedFetch};
pub use freshness::{CachedValue, FreshnessCache};
pub use key::{ApiQueryKey, QueryKey};
pub use layer::{CacheEvent, CacheLayer};
pub use traits::{CacheResult, CacheSource, Freshness, FreshnessPolicy};
