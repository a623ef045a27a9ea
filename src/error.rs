//! Error taxonomy shared by the cache, the API client and sync passes.

use thiserror::Error;

/// Failure of a single fetch against the backend.
///
/// Cloneable so that the deduplicator can hand the same failure to every
/// subscriber of an in-flight request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Connectivity problem or timeout.
  #[error("network error: {0}")]
  Network(String),

  /// Credentials were rejected; the session layer must re-authenticate.
  #[error("authentication failed: {0}")]
  Auth(String),

  /// Backend answered with a non-2xx status.
  #[error("server returned {status}: {message}")]
  Server { status: u16, message: String },

  /// Payload could not be decoded or encoded.
  #[error("failed to decode response: {0}")]
  Decode(String),

  /// A producer asked for its own key while computing it.
  #[error("request for {key} re-entered itself while in flight")]
  ReentrantRequest { key: String },

  /// The producing task panicked or was cancelled before settling.
  #[error("request aborted: {0}")]
  Aborted(String),
}

impl FetchError {
  pub fn is_auth(&self) -> bool {
    matches!(self, FetchError::Auth(_))
  }

  /// Client-side 4xx that will fail again unless the request changes.
  ///
  /// 408 and 429 are transient, 401 and 403 surface as [`FetchError::Auth`].
  pub fn is_permanent(&self) -> bool {
    match self {
      FetchError::Server { status, .. } => {
        (400..500).contains(status) && !matches!(status, 401 | 403 | 408 | 429)
      }
      FetchError::Decode(_) | FetchError::ReentrantRequest { .. } => true,
      _ => false,
    }
  }

  /// Whether the next natural trigger should simply try again.
  pub fn is_retryable(&self) -> bool {
    !self.is_auth() && !self.is_permanent()
  }
}

/// Failure of a sync pass step.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("persistent store error: {0}")]
  Store(String),
}

impl SyncError {
  pub fn store(err: impl std::fmt::Display) -> Self {
    SyncError::Store(err.to_string())
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, SyncError::Fetch(e) if e.is_auth())
  }
}
