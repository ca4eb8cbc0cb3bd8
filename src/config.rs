use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::executor::RetryPolicy;

/// Main configuration structure for Stageflow
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageflowConfig {
    /// Reminder scheduler settings
    pub scheduler: SchedulerConfig,
    /// Retry policy for side-effecting activities
    pub retry: RetryConfig,
    /// Instance store settings
    pub persistence: PersistenceConfig,
    /// Notification delivery settings
    pub notifications: NotificationConfig,
    /// Signal gateway settings
    pub gateway: GatewayConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Poll interval for the reminder loop in seconds
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts per activity before giving up
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// Directory for instance state and audit files
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Sends per second through the rate-limited wrapper
    pub sends_per_second: u32,
    /// Burst capacity
    pub burst_capacity: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Queued signals per instance before senders back-pressure
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level when RUST_LOG is unset
    pub log_level: String,
    /// Cached template entries
    pub template_cache_capacity: u64,
    /// Template cache TTL in seconds
    pub template_cache_ttl_seconds: u64,
}

impl Default for StageflowConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig {
                poll_interval_seconds: 30,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                jitter: true,
            },
            persistence: PersistenceConfig {
                data_dir: ".stageflow/instances".to_string(),
            },
            notifications: NotificationConfig {
                sends_per_second: 10,
                burst_capacity: 20,
            },
            gateway: GatewayConfig { queue_depth: 64 },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                template_cache_capacity: 100,
                template_cache_ttl_seconds: 300,
            },
        }
    }
}

impl StageflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (stageflow.toml)
    /// 3. Environment variables (prefixed with STAGEFLOW_)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&StageflowConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("stageflow.toml").exists() {
            builder = builder.add_source(File::with_name("stageflow"));
        }

        builder = builder.add_source(
            Environment::with_prefix("STAGEFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_seconds)
    }

    pub fn template_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.observability.template_cache_ttl_seconds)
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<StageflowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = StageflowConfig::load_env_file();
        StageflowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static StageflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_retry_policy() {
        let config = StageflowConfig::default();
        let policy = config.retry_policy();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(policy.jitter);
    }

    #[test]
    fn test_poll_interval_from_seconds() {
        let mut config = StageflowConfig::default();
        config.scheduler.poll_interval_seconds = 5;
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
    }
}
