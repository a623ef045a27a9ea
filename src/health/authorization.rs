//! Health permission classification.
//!
//! Read grants cannot be observed reliably on the device, so the resolved
//! state is a hint for the UI and a gate only in two cases: the device has no
//! health store, or every required type has been explicitly denied. In every
//! other state reads are attempted and their results trusted as-is.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::metrics::MetricType;
use super::source::{PermissionSource, PermissionStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAuthorizationState {
  /// Device reports no health data capability
  Unavailable,
  /// Nothing granted or denied yet for at least one type
  NotDetermined,
  Authorized,
  /// At least one type granted; `missing` lists every type that is not
  PartiallyAuthorized { missing: BTreeSet<MetricType> },
  /// Every required type was individually denied
  Denied,
}

impl HealthAuthorizationState {
  /// Classify per-type statuses.
  ///
  /// `Denied` requires every type to be denied: a single grant always yields
  /// `Authorized` or `PartiallyAuthorized`. With nothing granted, any type
  /// still undetermined yields `NotDetermined`, since a prompt can still
  /// succeed for it.
  pub fn classify(statuses: &BTreeMap<MetricType, PermissionStatus>) -> Self {
    let granted = statuses
      .values()
      .filter(|s| **s == PermissionStatus::Granted)
      .count();

    if granted == statuses.len() {
      return Self::Authorized;
    }

    if granted > 0 {
      let missing = statuses
        .iter()
        .filter(|(_, status)| **status != PermissionStatus::Granted)
        .map(|(metric, _)| *metric)
        .collect();
      return Self::PartiallyAuthorized { missing };
    }

    if statuses.values().all(|s| *s == PermissionStatus::Denied) {
      Self::Denied
    } else {
      Self::NotDetermined
    }
  }

  /// Whether the pipeline should attempt reads at all.
  pub fn allows_read_attempt(&self) -> bool {
    !matches!(self, Self::Unavailable | Self::Denied)
  }

  /// Only the user can change this state, through system settings.
  pub fn requires_user_action(&self) -> bool {
    matches!(self, Self::Denied)
  }

  /// Whether the system prompt can still change anything.
  pub fn should_prompt(&self) -> bool {
    matches!(self, Self::NotDetermined)
  }
}

/// Resolves the authorization state for a fixed set of required types.
#[derive(Clone)]
pub struct HealthAuthorizer {
  permissions: Arc<dyn PermissionSource>,
  required: Vec<MetricType>,
}

impl HealthAuthorizer {
  pub fn new(permissions: Arc<dyn PermissionSource>, required: Vec<MetricType>) -> Self {
    Self {
      permissions,
      required,
    }
  }

  pub fn required(&self) -> &[MetricType] {
    &self.required
  }

  /// Query every required type; re-run on each pass since the user may have
  /// changed permissions in system settings while the app was away.
  pub async fn resolve(&self) -> HealthAuthorizationState {
    if !self.permissions.is_available() {
      return HealthAuthorizationState::Unavailable;
    }

    let mut statuses = BTreeMap::new();
    for metric in &self.required {
      let status = self.permissions.authorization_status(*metric).await;
      statuses.insert(*metric, status);
    }

    let state = HealthAuthorizationState::classify(&statuses);
    debug!(?state, "resolved health authorization");
    state
  }

  /// Resolve, showing the system prompt first when nothing is decided yet.
  ///
  /// The prompt's outcome is unknowable; reads proceed optimistically after it.
  pub async fn resolve_and_prompt(&self) -> HealthAuthorizationState {
    let state = self.resolve().await;
    if state.should_prompt() {
      info!("requesting health authorization");
      self.permissions.request_authorization(&self.required).await;
      return self.resolve().await;
    }
    state
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use crate::health::source::PermissionStatus::{Denied, Granted, Undetermined};

  fn statuses(entries: &[(MetricType, PermissionStatus)]) -> BTreeMap<MetricType, PermissionStatus> {
    entries.iter().copied().collect()
  }

  #[test]
  fn test_mixed_statuses_are_partial_not_denied() {
    let state = HealthAuthorizationState::classify(&statuses(&[
      (MetricType::Steps, Denied),
      (MetricType::Sleep, Granted),
      (MetricType::HeartRateVariability, Undetermined),
    ]));

    let missing: BTreeSet<_> = [MetricType::Steps, MetricType::HeartRateVariability]
      .into_iter()
      .collect();
    assert_eq!(state, HealthAuthorizationState::PartiallyAuthorized { missing });
    assert!(state.allows_read_attempt());
  }

  #[test]
  fn test_all_granted_is_authorized() {
    let state = HealthAuthorizationState::classify(&statuses(&[
      (MetricType::Steps, Granted),
      (MetricType::Sleep, Granted),
    ]));
    assert_eq!(state, HealthAuthorizationState::Authorized);
  }

  #[test]
  fn test_all_denied_is_denied() {
    let state = HealthAuthorizationState::classify(&statuses(&[
      (MetricType::Steps, Denied),
      (MetricType::Sleep, Denied),
    ]));
    assert_eq!(state, HealthAuthorizationState::Denied);
    assert!(state.requires_user_action());
    assert!(!state.allows_read_attempt());
  }

  #[test]
  fn test_undetermined_without_grants_is_not_determined() {
    let fresh = HealthAuthorizationState::classify(&statuses(&[
      (MetricType::Steps, Undetermined),
      (MetricType::Sleep, Undetermined),
    ]));
    assert_eq!(fresh, HealthAuthorizationState::NotDetermined);

    let mixed = HealthAuthorizationState::classify(&statuses(&[
      (MetricType::Steps, Denied),
      (MetricType::Sleep, Undetermined),
    ]));
    assert_eq!(mixed, HealthAuthorizationState::NotDetermined);
  }

  /// Every combination of statuses over all metric types: any grant rules
  /// out `Denied`, and only an all-denied set produces it.
  #[test]
  fn test_denied_only_when_every_type_denied() {
    let options = [Granted, Denied, Undetermined];
    let types = MetricType::ALL;
    let combinations = options.len().pow(types.len() as u32);

    for n in 0..combinations {
      let mut code = n;
      let mut map = BTreeMap::new();
      for metric in types {
        map.insert(metric, options[code % options.len()]);
        code /= options.len();
      }

      let state = HealthAuthorizationState::classify(&map);
      let any_granted = map.values().any(|s| *s == Granted);
      let all_denied = map.values().all(|s| *s == Denied);

      if any_granted {
        assert!(
          matches!(
            state,
            HealthAuthorizationState::Authorized
              | HealthAuthorizationState::PartiallyAuthorized { .. }
          ),
          "{:?} classified as {:?}",
          map,
          state
        );
      }
      assert_eq!(state == HealthAuthorizationState::Denied, all_denied);
    }
  }

  struct FakePermissions {
    available: bool,
    status: PermissionStatus,
    after_prompt: PermissionStatus,
    prompts: AtomicUsize,
  }

  #[async_trait]
  impl PermissionSource for FakePermissions {
    fn is_available(&self) -> bool {
      self.available
    }

    async fn authorization_status(&self, _metric: MetricType) -> PermissionStatus {
      if self.prompts.load(Ordering::SeqCst) > 0 {
        self.after_prompt
      } else {
        self.status
      }
    }

    async fn request_authorization(&self, _metrics: &[MetricType]) {
      self.prompts.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn authorizer(fake: FakePermissions) -> (Arc<FakePermissions>, HealthAuthorizer) {
    let fake = Arc::new(fake);
    let authorizer = HealthAuthorizer::new(fake.clone(), MetricType::all());
    (fake, authorizer)
  }

  #[tokio::test]
  async fn test_unavailable_short_circuits() {
    let (fake, authorizer) = authorizer(FakePermissions {
      available: false,
      status: Granted,
      after_prompt: Granted,
      prompts: AtomicUsize::new(0),
    });
    assert_eq!(
      authorizer.resolve_and_prompt().await,
      HealthAuthorizationState::Unavailable
    );
    assert_eq!(fake.prompts.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_prompts_once_when_not_determined() {
    let (fake, authorizer) = authorizer(FakePermissions {
      available: true,
      status: Undetermined,
      after_prompt: Granted,
      prompts: AtomicUsize::new(0),
    });
    assert_eq!(
      authorizer.resolve_and_prompt().await,
      HealthAuthorizationState::Authorized
    );
    assert_eq!(fake.prompts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_denied_does_not_prompt() {
    let (fake, authorizer) = authorizer(FakePermissions {
      available: true,
      status: Denied,
      after_prompt: Granted,
      prompts: AtomicUsize::new(0),
    });
    assert_eq!(
      authorizer.resolve_and_prompt().await,
      HealthAuthorizationState::Denied
    );
    assert_eq!(fake.prompts.load(Ordering::SeqCst), 0);
  }
}
