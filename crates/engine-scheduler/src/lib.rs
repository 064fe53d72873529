//! C7: cron triggers, delayed-request dispatch, and stuck-run cleanup.

pub mod config;
pub mod cron;
pub mod delayed;
pub mod scheduler;
pub mod stuck;

pub use config::SchedulerConfig;
pub use cron::{CronCatalog, CronError, CronFiring, CronTrigger};
pub use delayed::{DelayedRequestError, DelayedRequestStore, DueDelayedRequest};
pub use scheduler::Scheduler;
pub use stuck::StuckRunSweeper;
