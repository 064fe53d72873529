//! Tracing initialization, mirroring
//! `golem_common::tracing::init_tracing_with_default_env_filter`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
    pub default_level: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            default_level: "info".to_string(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("engine")
    }
}

impl crate::SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "service: {}, json: {}, default_level: {}",
            self.service_name, self.json, self.default_level
        )
    }
}

/// Installs a global `tracing` subscriber. Idempotent-ish: intended to be
/// called exactly once from each binary's `main`.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
