//! Kernel configuration
//!
//! Everything is read from the environment (a `.env` file is honoured).
//! Only `COLLECTOR_TENANTS`, `DATABASE_URL` and `PIPELINE_PAT` are required.

use anyhow::{bail, Context, Result};
use collector_common::TenantId;
use std::path::PathBuf;
use std::time::Duration;

use crate::collector::connector::{
    ConnectorConfig, DEFAULT_CONNECTOR_INTERVAL_SECS, DEFAULT_CONNECTOR_MAX_KEYS,
    DEFAULT_CONNECTOR_PREFIX, DEFAULT_DEAD_LETTER_PREFIX,
};
use crate::collector::monitor::DEFAULT_MONITOR_INTERVAL_SECS;
use crate::collector::pipeline::{
    Credential, PipelineConfig, DEFAULT_PIPELINE_BASE_URL, DEFAULT_PIPELINE_TIMEOUT_SECS,
};
use crate::collector::reclaimer::{
    ReclaimerConfig, DEFAULT_RECLAIMER_INTERVAL_SECS, DEFAULT_RECLAIM_TIMEOUT_SECS,
    DEFAULT_RETRY_DELAY_SECS,
};
use crate::collector::rollup::{
    RollupConfig, DEFAULT_ROLLUP_BATCH_SIZE, DEFAULT_ROLLUP_INTERVAL_SECS,
};
use crate::collector::scheduler::{
    SchedulerConfig, DEFAULT_SCHEDULER_BATCH_SIZE, DEFAULT_SCHEDULER_INTERVAL_SECS,
};
use crate::collector::stager::{
    StagerConfig, DEFAULT_MAX_RETRIES, DEFAULT_STAGER_BATCH_SIZE, DEFAULT_STAGER_INTERVAL_SECS,
};
use crate::db::DbConfig;
use crate::storage::StorageConfig;
use crate::worker::DEFAULT_MAX_BACKOFF_SECS;

/// Default location of the module catalog.
pub const DEFAULT_MODULES_PATH: &str = "collector-modules.toml";

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub tenants: Vec<TenantId>,
    pub modules_path: PathBuf,
    pub database: DbConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub connector: ConnectorConfig,
    pub scheduler: SchedulerConfig,
    pub stager: StagerConfig,
    pub rollup: RollupConfig,
    pub reclaimer: ReclaimerConfig,
    pub monitor_interval: Duration,
    pub max_backoff: Duration,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &str, default: u64) -> Result<Duration> {
    env_or(key, default).map(Duration::from_secs)
}

fn parse_tenants(raw: &str) -> Result<Vec<TenantId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| TenantId::parse(s).with_context(|| format!("Invalid tenant '{}'", s)))
        .collect()
}

impl KernelConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let tenants = parse_tenants(&std::env::var("COLLECTOR_TENANTS").unwrap_or_default())?;
        let token = std::env::var("PIPELINE_PAT").unwrap_or_default();
        let max_retries = env_or("SCHEDULER_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;

        let config = KernelConfig {
            tenants,
            modules_path: std::env::var("COLLECTOR_MODULES_PATH")
                .unwrap_or_else(|_| DEFAULT_MODULES_PATH.to_string())
                .into(),
            database: DbConfig::from_env().context("Failed to load database configuration")?,
            storage: StorageConfig::from_env()?,
            pipeline: PipelineConfig {
                base_url: std::env::var("PIPELINE_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_PIPELINE_BASE_URL.to_string()),
                credential: Credential::new(token),
                timeout_secs: env_or("PIPELINE_TIMEOUT_SECS", DEFAULT_PIPELINE_TIMEOUT_SECS)?,
            },
            connector: ConnectorConfig {
                prefix: std::env::var("CONNECTOR_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_CONNECTOR_PREFIX.to_string()),
                dead_letter_prefix: std::env::var("CONNECTOR_DEAD_LETTER_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_DEAD_LETTER_PREFIX.to_string()),
                max_keys: env_or("CONNECTOR_MAX_KEYS", DEFAULT_CONNECTOR_MAX_KEYS)?,
                default_topic_code: std::env::var("CONNECTOR_DEFAULT_TOPIC")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                max_retries,
                interval: secs_or("CONNECTOR_INTERVAL_SECS", DEFAULT_CONNECTOR_INTERVAL_SECS)?,
            },
            scheduler: SchedulerConfig {
                batch_size: env_or("SCHEDULER_BATCH_SIZE", DEFAULT_SCHEDULER_BATCH_SIZE)?,
                interval: secs_or("SCHEDULER_INTERVAL_SECS", DEFAULT_SCHEDULER_INTERVAL_SECS)?,
            },
            stager: StagerConfig {
                batch_size: env_or("STAGER_BATCH_SIZE", DEFAULT_STAGER_BATCH_SIZE)?,
                max_retries,
                interval: secs_or("STAGER_INTERVAL_SECS", DEFAULT_STAGER_INTERVAL_SECS)?,
            },
            rollup: RollupConfig {
                batch_size: env_or("ROLLUP_BATCH_SIZE", DEFAULT_ROLLUP_BATCH_SIZE)?,
                interval: secs_or("ROLLUP_INTERVAL_SECS", DEFAULT_ROLLUP_INTERVAL_SECS)?,
            },
            reclaimer: ReclaimerConfig {
                timeout: secs_or("RECLAIMER_TIMEOUT_SECS", DEFAULT_RECLAIM_TIMEOUT_SECS)?,
                retry_delay: secs_or("RECLAIMER_RETRY_DELAY_SECS", DEFAULT_RETRY_DELAY_SECS)?,
                interval: secs_or("RECLAIMER_INTERVAL_SECS", DEFAULT_RECLAIMER_INTERVAL_SECS)?,
            },
            monitor_interval: secs_or("MONITOR_INTERVAL_SECS", DEFAULT_MONITOR_INTERVAL_SECS)?,
            max_backoff: secs_or("WORKER_MAX_BACKOFF_SECS", DEFAULT_MAX_BACKOFF_SECS)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tenants.is_empty() {
            bail!("COLLECTOR_TENANTS must list at least one tenant");
        }

        self.database
            .validate()
            .context("Invalid database configuration")?;

        if self.pipeline.credential.token().trim().is_empty() {
            bail!("PIPELINE_PAT must be set");
        }
        if self.pipeline.base_url.trim().is_empty() {
            bail!("PIPELINE_BASE_URL cannot be empty");
        }

        if self.connector.prefix.trim_matches('/').is_empty() {
            bail!("CONNECTOR_PREFIX cannot be empty");
        }
        if self.connector.prefix.trim_matches('/')
            == self.connector.dead_letter_prefix.trim_matches('/')
        {
            bail!("CONNECTOR_DEAD_LETTER_PREFIX must differ from CONNECTOR_PREFIX");
        }
        if self.connector.max_keys <= 0 {
            bail!("CONNECTOR_MAX_KEYS must be greater than 0");
        }
        if self.scheduler.batch_size <= 0
            || self.stager.batch_size <= 0
            || self.rollup.batch_size <= 0
        {
            bail!("Batch sizes must be greater than 0");
        }
        if self.stager.max_retries < 0 {
            bail!("SCHEDULER_MAX_RETRIES cannot be negative");
        }
        if self.reclaimer.timeout.is_zero() {
            bail!("RECLAIMER_TIMEOUT_SECS must be greater than 0");
        }

        let intervals = [
            self.connector.interval,
            self.scheduler.interval,
            self.stager.interval,
            self.rollup.interval,
            self.reclaimer.interval,
            self.monitor_interval,
        ];
        if intervals.iter().any(Duration::is_zero) {
            bail!("Worker intervals must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "COLLECTOR_TENANTS",
        "DATABASE_URL",
        "PIPELINE_PAT",
        "SCHEDULER_BATCH_SIZE",
        "CONNECTOR_MAX_KEYS",
        "CONNECTOR_DEFAULT_TOPIC",
        "RECLAIMER_TIMEOUT_SECS",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn set_required() {
        std::env::set_var("COLLECTOR_TENANTS", "acme, globex");
        std::env::set_var("DATABASE_URL", "postgresql://localhost/collector_test");
        std::env::set_var("PIPELINE_PAT", "pat-123");
    }

    #[test]
    fn test_parse_tenants() {
        let tenants = parse_tenants("acme, globex,,").unwrap();
        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants[1].as_str(), "globex");
        assert!(parse_tenants("acme,bad tenant").is_err());
        assert!(parse_tenants("").unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_load_with_defaults() {
        clear();
        set_required();

        let config = KernelConfig::load().unwrap();
        assert_eq!(config.tenants.len(), 2);
        assert_eq!(config.scheduler.batch_size, DEFAULT_SCHEDULER_BATCH_SIZE);
        assert_eq!(config.connector.prefix, DEFAULT_CONNECTOR_PREFIX);
        assert_eq!(config.connector.default_topic_code, None);
        assert_eq!(
            config.reclaimer.timeout,
            Duration::from_secs(DEFAULT_RECLAIM_TIMEOUT_SECS)
        );
        assert_eq!(config.pipeline.credential.token(), "pat-123");

        clear();
    }

    #[test]
    #[serial]
    fn test_load_overrides() {
        clear();
        set_required();
        std::env::set_var("SCHEDULER_BATCH_SIZE", "25");
        std::env::set_var("CONNECTOR_DEFAULT_TOPIC", "fallback");
        std::env::set_var("RECLAIMER_TIMEOUT_SECS", "90");

        let config = KernelConfig::load().unwrap();
        assert_eq!(config.scheduler.batch_size, 25);
        assert_eq!(config.connector.default_topic_code.as_deref(), Some("fallback"));
        assert_eq!(config.reclaimer.timeout, Duration::from_secs(90));

        clear();
    }

    #[test]
    #[serial]
    fn test_missing_pat_rejected() {
        clear();
        set_required();
        std::env::remove_var("PIPELINE_PAT");

        let err = KernelConfig::load().unwrap_err();
        assert!(err.to_string().contains("PIPELINE_PAT"));

        clear();
    }

    #[test]
    #[serial]
    fn test_invalid_number_rejected() {
        clear();
        set_required();
        std::env::set_var("CONNECTOR_MAX_KEYS", "lots");

        let err = KernelConfig::load().unwrap_err();
        assert!(err.to_string().contains("CONNECTOR_MAX_KEYS"));

        clear();
    }

    #[test]
    #[serial]
    fn test_no_tenants_rejected() {
        clear();
        set_required();
        std::env::set_var("COLLECTOR_TENANTS", " , ");

        assert!(KernelConfig::load().is_err());

        clear();
    }
}
