//! Configuration for the Span Segment Flusher

use serde::Deserialize;

use crate::error::{FlusherError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Segment buffer
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_max_flush_segments")]
    pub max_flush_segments: usize,
    /// The fixed subset of Buffer shards this Worker drains, per §3's
    /// "assigned shards" invariant (fixed for the Worker's lifetime).
    #[serde(default = "default_assigned_shards")]
    pub assigned_shards: Vec<u32>,

    // Downstream sink
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
    #[serde(default = "default_topic")]
    pub topic: String,

    // Backpressure
    #[serde(default = "default_max_memory_percentage")]
    pub max_memory_percentage: f64,

    // Lifecycle tunables
    #[serde(default = "default_max_process_restarts")]
    pub max_process_restarts: u32,
    #[serde(default = "default_idle_sleep_secs")]
    pub idle_sleep_secs: u64,
    #[serde(default = "default_join_poll_interval_ms")]
    pub join_poll_interval_ms: u64,

    // Metrics server
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_flush_segments() -> usize {
    50
}

fn default_assigned_shards() -> Vec<u32> {
    (0..4).collect()
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_topic() -> String {
    "span-segments".to_string()
}

fn default_max_memory_percentage() -> f64 {
    0.9
}

fn default_max_process_restarts() -> u32 {
    10
}

fn default_idle_sleep_secs() -> u64 {
    1
}

fn default_join_poll_interval_ms() -> u64 {
    100
}

fn default_metrics_bind() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logs() -> bool {
    false
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            max_flush_segments: default_max_flush_segments(),
            assigned_shards: default_assigned_shards(),
            nats_url: default_nats_url(),
            topic: default_topic(),
            max_memory_percentage: default_max_memory_percentage(),
            max_process_restarts: default_max_process_restarts(),
            idle_sleep_secs: default_idle_sleep_secs(),
            join_poll_interval_ms: default_join_poll_interval_ms(),
            metrics_bind: default_metrics_bind(),
            metrics_enabled: default_metrics_enabled(),
            log_level: default_log_level(),
            json_logs: default_json_logs(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration. `max_memory_percentage` must sit in
    /// (0.0, 1.0]; 1.0 disables the hard-backpressure check entirely.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_memory_percentage > 0.0 && self.max_memory_percentage <= 1.0) {
            return Err(FlusherError::ConfigError(config::ConfigError::Message(
                format!(
                    "max_memory_percentage must be in (0.0, 1.0], got {}",
                    self.max_memory_percentage
                ),
            )));
        }
        if self.max_flush_segments == 0 {
            return Err(FlusherError::ConfigError(config::ConfigError::Message(
                "max_flush_segments must be positive".to_string(),
            )));
        }
        if self.assigned_shards.is_empty() {
            return Err(FlusherError::ConfigError(config::ConfigError::Message(
                "assigned_shards must not be empty".to_string(),
            )));
        }
        Ok(())
    }

    pub fn idle_sleep(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_sleep_secs)
    }

    pub fn join_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.join_poll_interval_ms)
    }

    /// The memory check is a no-op at the 1.0 boundary.
    pub fn memory_check_enabled(&self) -> bool {
        self.max_memory_percentage < 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.max_flush_segments, 50);
        assert_eq!(config.max_process_restarts, 10);
        assert_eq!(config.idle_sleep_secs, 1);
        assert_eq!(config.join_poll_interval_ms, 100);
        assert!(config.memory_check_enabled());
    }

    #[test]
    fn test_memory_percentage_of_one_disables_check() {
        let mut config = Config::default();
        config.max_memory_percentage = 1.0;
        assert!(config.validate().is_ok());
        assert!(!config.memory_check_enabled());
    }

    #[test]
    fn test_memory_percentage_out_of_range_rejected() {
        let mut config = Config::default();
        config.max_memory_percentage = 0.0;
        assert!(config.validate().is_err());

        config.max_memory_percentage = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_flush_segments_rejected() {
        let mut config = Config::default();
        config.max_flush_segments = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_assigned_shards_rejected() {
        let mut config = Config::default();
        config.assigned_shards = vec![];
        assert!(config.validate().is_err());
    }
}
