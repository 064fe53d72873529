//! Scheduler configuration (spec §4.7, glossary `scheduler.*`).

use engine_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cron and delayed-request sweep cadence. Second precision per spec.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// `scheduler.stuck_sweep_ms` — how often `Running`/`Cancelling` runs
    /// with an expired owning-pool heartbeat are swept.
    #[serde(with = "humantime_serde")]
    pub stuck_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            stuck_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl SafeDisplay for SchedulerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(result, "tick_interval: {:?}", self.tick_interval);
        let _ = write!(result, "stuck_sweep_interval: {:?}", self.stuck_sweep_interval);
        result
    }
}
