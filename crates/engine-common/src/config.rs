//! Figment-backed config loading, in the teacher's `ConfigLoader` idiom
//! (`cloud-service::config::make_config_loader`,
//! `cloud-common::config::MergedConfigLoader`).

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Loads a config of type `T` from (in increasing precedence):
/// 1. `T::default()`,
/// 2. the TOML file at `config_file_name` if present,
/// 3. environment variables prefixed `ENGINE__`, double-underscore nested
///    (`ENGINE__POOL__MAX_WORKERS=16`).
pub struct ConfigLoader<T> {
    pub config_file_name: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> ConfigLoader<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    pub fn new(config_file_name: &Path) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> figment::Result<T> {
        Figment::from(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("ENGINE__").split("__"))
            .extract()
    }

    /// Mirrors the teacher's `--dump-config` short-circuit: if invoked with
    /// the env var set, prints the effective (secret-masked) config and
    /// returns `None` so the caller's `main` exits without starting services.
    pub fn load_or_dump_config(&self) -> Option<T>
    where
        T: crate::SafeDisplay,
    {
        let config = self.load().expect("failed to load configuration");
        if std::env::var("ENGINE_DUMP_CONFIG").is_ok() {
            println!("{}", config.to_safe_string());
            None
        } else {
            Some(config)
        }
    }
}

/// Retry/backoff shape referenced by the dispatcher's negative-ack hint
/// (spec §4.5) and by any remote client the bootstrap crate wires up.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde")]
    pub min_delay: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: std::time::Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: std::time::Duration::from_millis(200),
            max_delay: std::time::Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl crate::SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "min_delay: {:?}, max_delay: {:?}, multiplier: {}, max_attempts: {}",
            self.min_delay, self.max_delay, self.multiplier, self.max_attempts
        )
    }
}

impl RetryConfig {
    /// Backoff delay for the given (1-indexed) attempt number, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let scaled = self.min_delay.as_secs_f64() * self.multiplier.powi(attempt.max(1) as i32 - 1);
        std::time::Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_backs_off_and_caps() {
        let cfg = RetryConfig::default();
        let d1 = cfg.delay_for_attempt(1);
        let d2 = cfg.delay_for_attempt(2);
        assert!(d2 > d1);
        let d_huge = cfg.delay_for_attempt(1000);
        assert_eq!(d_huge, cfg.max_delay);
    }
}
