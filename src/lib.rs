//! Client-side data freshness and sync coordination.
//!
//! Backend reads go through a stale-while-revalidate cache with request
//! de-duplication; a scheduler drives sync passes from app lifecycle
//! triggers and pushes aggregated daily health metrics to the backend.

pub mod api;
pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod store;
pub mod sync;

pub use app::{App, AppDeps};
pub use config::Config;
pub use error::{FetchError, SyncError};
