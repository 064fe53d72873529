//! Pool configuration (spec §4.4).

use engine_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_binary_path: String,
    pub worker_config_path: String,
    #[serde(with = "humantime_serde")]
    pub default_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub terminate_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub backpressure_window: Duration,
    pub backpressure_queue_watermark: usize,
    pub default_memory_limit_bytes: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            worker_binary_path: "engine-worker".to_string(),
            worker_config_path: "worker.toml".to_string(),
            default_deadline: Duration::from_secs(300),
            terminate_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            backpressure_window: Duration::from_secs(5),
            backpressure_queue_watermark: 64,
            default_memory_limit_bytes: 512 * 1024 * 1024,
        }
    }
}

impl SafeDisplay for PoolConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(result, "min_workers: {}", self.min_workers);
        let _ = writeln!(result, "max_workers: {}", self.max_workers);
        let _ = writeln!(result, "worker_binary_path: {}", self.worker_binary_path);
        let _ = writeln!(result, "default_deadline: {:?}", self.default_deadline);
        let _ = writeln!(result, "terminate_grace: {:?}", self.terminate_grace);
        let _ = writeln!(result, "kill_grace: {:?}", self.kill_grace);
        let _ = writeln!(result, "heartbeat_interval: {:?}", self.heartbeat_interval);
        let _ = write!(
            result,
            "default_memory_limit_bytes: {}",
            self.default_memory_limit_bytes
        );
        result
    }
}
