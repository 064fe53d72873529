//! Process wiring: config, every C1-C8 background loop, metrics, graceful
//! shutdown.

pub mod bootstrap;
pub mod config;
pub mod metrics;
pub mod metrics_server;

pub use bootstrap::Engine;
pub use config::EngineConfig;
pub use metrics::Metrics;
