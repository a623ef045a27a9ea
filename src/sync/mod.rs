//! Background sync: upstream tasks and the scheduler that runs them.

mod scheduler;
mod task;

pub use scheduler::{
  PassReport, SchedulerEvent, SyncScheduler, TriggerOutcome, TriggerReason, TriggerSkip,
};
pub use task::{PrefetchTask, SyncTask};
