use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Top-level settings, loaded from (lowest to highest priority): hardcoded
/// defaults, `default.toml`, `local.toml`, then `AVIARY_`-prefixed
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub driver: DriverSettings,
    pub pool: PoolSettings,
    pub migration: MigrationSettings,
    pub webhooks: WebhookSettings,
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Connector backend. Only the in-process "fake" backend ships with the
    /// core; real hypervisor drivers plug in through the `Connector` trait.
    pub backend: String,
    pub default_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub min_connections: usize,
    pub max_connections: usize,
    pub ttl_seconds: u64,
    pub health_check_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    pub bandwidth_mbps: u32,
    pub max_downtime_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub backoff_cap_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub network_name: String,
    pub batch_max_concurrency: usize,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("AVIARY_CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        let config = Config::builder()
            .set_default("state_dir", "/var/lib/aviary")?
            .set_default("driver.backend", "fake")?
            .set_default("driver.default_uri", "qemu:///system")?
            .set_default("pool.min_connections", 1)?
            .set_default("pool.max_connections", 10)?
            .set_default("pool.ttl_seconds", 300)?
            .set_default("pool.health_check_interval_seconds", 60)?
            .set_default("migration.bandwidth_mbps", 100)?
            .set_default("migration.max_downtime_ms", 300)?
            .set_default("webhooks.timeout_seconds", 10)?
            .set_default("webhooks.max_attempts", 5)?
            .set_default("webhooks.backoff_cap_seconds", 256)?
            .set_default("orchestrator.network_name", "default")?
            .set_default("orchestrator.batch_max_concurrency", 3)?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(config::Environment::with_prefix("AVIARY").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            state_dir: PathBuf::from("/var/lib/aviary"),
            driver: DriverSettings {
                backend: "fake".to_string(),
                default_uri: "qemu:///system".to_string(),
            },
            pool: PoolSettings {
                min_connections: 1,
                max_connections: 10,
                ttl_seconds: 300,
                health_check_interval_seconds: 60,
            },
            migration: MigrationSettings {
                bandwidth_mbps: 100,
                max_downtime_ms: 300,
            },
            webhooks: WebhookSettings {
                timeout_seconds: 10,
                max_attempts: 5,
                backoff_cap_seconds: 256,
            },
            orchestrator: OrchestratorSettings {
                network_name: "default".to_string(),
                batch_max_concurrency: 3,
            },
        }
    }
}

impl PoolSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }
}
