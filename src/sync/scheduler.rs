//! Sync scheduler: lifecycle triggers, periodic timer and single-pass guard.
//!
//! A pass is `idle -> syncing -> idle`. Triggers that arrive while a pass is
//! running are dropped, not queued. Errors never leave the scheduler in a
//! failed state; the next trigger simply tries again.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::task::SyncTask;
use crate::clock::Clock;
use crate::error::SyncError;
use crate::health::{HealthAuthorizationState, HealthAuthorizer, HealthSyncOutcome, HealthSyncPipeline};
use crate::store::{KeyValueStore, LAST_SYNC_COMPLETED_AT};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
  AppLaunch,
  Foreground,
  Periodic,
  Manual,
}

/// Why a trigger did not start a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSkip {
  AlreadySyncing,
  NotAuthenticated,
  /// `on_app_launch` already ran in this process
  AlreadyLaunched,
  /// The periodic timer that fired was cancelled or replaced
  TimerCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
  Ran(PassReport),
  Skipped(TriggerSkip),
}

/// What one pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
  pub reason: TriggerReason,
  pub authorization: HealthAuthorizationState,
  /// Names of upstream tasks that failed
  pub failed_tasks: Vec<String>,
  pub health: Option<HealthSyncOutcome>,
  pub health_error: Option<String>,
  /// Credentials were rejected; the pass stopped early
  pub authentication_required: bool,
}

impl PassReport {
  fn new(reason: TriggerReason, authorization: HealthAuthorizationState) -> Self {
    Self {
      reason,
      authorization,
      failed_tasks: Vec::new(),
      health: None,
      health_error: None,
      authentication_required: false,
    }
  }

  pub fn is_success(&self) -> bool {
    self.failed_tasks.is_empty() && self.health_error.is_none() && !self.authentication_required
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
  PassStarted(TriggerReason),
  PassCompleted(PassReport),
  PassFailed(PassReport),
  /// Resolved authorization differs from the previous pass
  AuthorizationChanged(HealthAuthorizationState),
  /// The backend rejected our credentials; periodic sync is stopped
  AuthenticationRequired,
}

#[derive(Default)]
struct State {
  syncing: bool,
  launched: bool,
  authenticated: bool,
  /// Bumped on every start and cancel; a tick from an older timer is void
  generation: u64,
  timer: Option<JoinHandle<()>>,
  authorization: Option<HealthAuthorizationState>,
}

struct Inner {
  interval: Duration,
  authorizer: HealthAuthorizer,
  tasks: Vec<Arc<dyn SyncTask>>,
  pipeline: Option<Arc<HealthSyncPipeline>>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  state: Mutex<State>,
  events: broadcast::Sender<SchedulerEvent>,
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Drives sync passes from lifecycle triggers and a periodic timer.
#[derive(Clone)]
pub struct SyncScheduler {
  inner: Arc<Inner>,
}

/// Returns the scheduler to idle however the pass ends.
struct SyncingGuard {
  inner: Arc<Inner>,
}

impl Drop for SyncingGuard {
  fn drop(&mut self) {
    self.inner.lock().syncing = false;
  }
}

impl SyncScheduler {
  pub fn new(
    interval: Duration,
    authorizer: HealthAuthorizer,
    tasks: Vec<Arc<dyn SyncTask>>,
    pipeline: Option<Arc<HealthSyncPipeline>>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        interval,
        authorizer,
        tasks,
        pipeline,
        store,
        clock,
        state: Mutex::new(State::default()),
        events,
      }),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
    self.inner.events.subscribe()
  }

  pub fn interval(&self) -> Duration {
    self.inner.interval
  }

  pub fn is_syncing(&self) -> bool {
    self.inner.lock().syncing
  }

  pub fn is_authenticated(&self) -> bool {
    self.inner.lock().authenticated
  }

  pub fn is_periodic_running(&self) -> bool {
    self
      .inner
      .lock()
      .timer
      .as_ref()
      .map_or(false, |handle| !handle.is_finished())
  }

  /// Authorization resolved by the most recent pass.
  pub fn authorization(&self) -> Option<HealthAuthorizationState> {
    self.inner.lock().authorization.clone()
  }

  pub fn last_completed_at(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
    self
      .inner
      .store
      .get_timestamp(LAST_SYNC_COMPLETED_AT)
      .map_err(SyncError::store)
  }

  /// Mark the session authenticated; triggers are ignored until then.
  pub fn start_session(&self) {
    self.inner.lock().authenticated = true;
    info!("sync session started");
  }

  /// End the session: stop the timer and ignore triggers until re-authenticated.
  pub fn sign_out(&self) {
    self.inner.lock().authenticated = false;
    self.cancel_periodic();
    info!("sync session ended");
  }

  /// Run the first pass of this process. Later calls are no-ops.
  pub async fn on_app_launch(&self) -> TriggerOutcome {
    {
      let mut state = self.inner.lock();
      if !state.authenticated {
        return TriggerOutcome::Skipped(TriggerSkip::NotAuthenticated);
      }
      if state.launched {
        return TriggerOutcome::Skipped(TriggerSkip::AlreadyLaunched);
      }
      state.launched = true;
    }
    self.trigger(TriggerReason::AppLaunch).await
  }

  /// App became active: resume the timer and sync now.
  pub async fn on_foreground(&self) -> TriggerOutcome {
    if !self.is_authenticated() {
      return TriggerOutcome::Skipped(TriggerSkip::NotAuthenticated);
    }
    self.start_periodic();
    self.trigger(TriggerReason::Foreground).await
  }

  pub fn on_background(&self) {
    self.cancel_periodic();
  }

  /// Start the periodic timer unless one is already running.
  ///
  /// The first tick fires one full interval from now. Must be called from
  /// within a tokio runtime.
  pub fn start_periodic(&self) {
    let mut state = self.inner.lock();
    if !state.authenticated {
      return;
    }
    if state.timer.as_ref().map_or(false, |h| !h.is_finished()) {
      return;
    }

    state.generation += 1;
    let generation = state.generation;
    let period = self.inner.interval;
    let weak = Arc::downgrade(&self.inner);

    state.timer = Some(tokio::spawn(periodic_loop(weak, generation, period)));
    debug!(?period, generation, "periodic sync started");
  }

  /// Stop the periodic timer. No tick fires after this returns.
  pub fn cancel_periodic(&self) {
    let mut state = self.inner.lock();
    state.generation += 1;
    if let Some(handle) = state.timer.take() {
      handle.abort();
      debug!(generation = state.generation, "periodic sync cancelled");
    }
  }

  /// Start a pass now unless one is running.
  pub async fn trigger(&self, reason: TriggerReason) -> TriggerOutcome {
    self.trigger_in_generation(reason, None).await
  }

  /// Like [`SyncScheduler::trigger`], but only while the timer generation
  /// still matches. Both checks happen under one lock so a cancel cannot
  /// slip in between.
  async fn trigger_in_generation(
    &self,
    reason: TriggerReason,
    generation: Option<u64>,
  ) -> TriggerOutcome {
    let _guard = {
      let mut state = self.inner.lock();
      if generation.is_some_and(|g| g != state.generation) {
        return TriggerOutcome::Skipped(TriggerSkip::TimerCancelled);
      }
      if !state.authenticated {
        return TriggerOutcome::Skipped(TriggerSkip::NotAuthenticated);
      }
      if state.syncing {
        debug!(?reason, "sync already running, trigger dropped");
        return TriggerOutcome::Skipped(TriggerSkip::AlreadySyncing);
      }
      state.syncing = true;
      SyncingGuard {
        inner: Arc::clone(&self.inner),
      }
    };

    TriggerOutcome::Ran(self.run_pass(reason).await)
  }

  async fn run_pass(&self, reason: TriggerReason) -> PassReport {
    info!(?reason, "sync pass started");
    self.emit(SchedulerEvent::PassStarted(reason));

    // Permissions may have changed in system settings while we were away
    let authorization = self.inner.authorizer.resolve_and_prompt().await;
    self.note_authorization(&authorization);
    let mut report = PassReport::new(reason, authorization);

    for task in &self.inner.tasks {
      if let Err(e) = task.run().await {
        warn!(task = task.name(), error = %e, "sync task failed");
        report.failed_tasks.push(task.name().to_string());
        if e.is_auth() {
          self.authentication_lost();
          report.authentication_required = true;
          return self.finish(report);
        }
      }
    }

    if let Some(pipeline) = &self.inner.pipeline {
      let result = pipeline.sync(&report.authorization).await;
      match result {
        Ok(outcome) => {
          debug!(?outcome, "health sync finished");
          report.health = Some(outcome);
        }
        Err(e) => {
          warn!(error = %e, "health sync failed");
          if e.is_auth() {
            self.authentication_lost();
            report.authentication_required = true;
          }
          report.health_error = Some(e.to_string());
        }
      }
    }

    if report.is_success() {
      let now = self.inner.clock.now();
      if let Err(e) = self.inner.store.set_timestamp(LAST_SYNC_COMPLETED_AT, now) {
        error!(error = %e, "failed to persist sync completion time");
      }
    }

    self.finish(report)
  }

  fn finish(&self, report: PassReport) -> PassReport {
    if report.is_success() {
      info!(reason = ?report.reason, "sync pass completed");
      self.emit(SchedulerEvent::PassCompleted(report.clone()));
    } else {
      warn!(
        reason = ?report.reason,
        failed_tasks = ?report.failed_tasks,
        health_error = ?report.health_error,
        "sync pass finished with errors"
      );
      self.emit(SchedulerEvent::PassFailed(report.clone()));
    }
    report
  }

  fn note_authorization(&self, authorization: &HealthAuthorizationState) {
    let changed = {
      let mut state = self.inner.lock();
      let changed = state.authorization.as_ref() != Some(authorization);
      state.authorization = Some(authorization.clone());
      changed
    };
    if changed {
      info!(?authorization, "health authorization changed");
      self.emit(SchedulerEvent::AuthorizationChanged(authorization.clone()));
    }
  }

  fn authentication_lost(&self) {
    error!("backend rejected credentials, stopping periodic sync");
    self.inner.lock().authenticated = false;
    self.emit(SchedulerEvent::AuthenticationRequired);
    self.cancel_periodic();
  }

  fn emit(&self, event: SchedulerEvent) {
    // No receivers is fine
    let _ = self.inner.events.send(event);
  }
}

async fn periodic_loop(weak: Weak<Inner>, generation: u64, period: Duration) {
  let mut ticker = time::interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    ticker.tick().await;

    let Some(inner) = weak.upgrade() else {
      return;
    };

    // A tick already queued when the timer was cancelled must not run
    let scheduler = SyncScheduler { inner };
    let outcome = scheduler
      .trigger_in_generation(TriggerReason::Periodic, Some(generation))
      .await;
    if outcome == TriggerOutcome::Skipped(TriggerSkip::TimerCancelled) {
      return;
    }
  }
}
