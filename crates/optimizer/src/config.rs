//! Controller configuration

use anyhow::{Context, Result};
use optimizer_lib::{ReconcileConfig, SchedulerConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Maximum concurrent reconciliation passes
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delay between completed passes in seconds
    #[serde(default = "default_requeue_after")]
    pub requeue_after_secs: u64,

    /// Delay after a scanner construction failure in seconds
    #[serde(default = "default_failure_backoff")]
    pub failure_backoff_secs: u64,

    /// Delay after a status write conflict in seconds
    #[serde(default = "default_conflict_retry")]
    pub conflict_retry_secs: u64,

    /// Delay after any other failed pass in seconds
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// Deadline for a single pass in seconds
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_secs: u64,

    /// JSON file with policy manifests
    #[serde(default)]
    pub policies_path: Option<PathBuf>,

    /// JSON file with the resource inventory
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "resource-optimizer".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    4
}

fn default_requeue_after() -> u64 {
    3600
}

fn default_failure_backoff() -> u64 {
    600
}

fn default_conflict_retry() -> u64 {
    5
}

fn default_error_backoff() -> u64 {
    30
}

fn default_pass_timeout() -> u64 {
    300
}

impl ControllerConfig {
    /// Load configuration from `OPTIMIZER_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("OPTIMIZER"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder()
            .add_source(source)
            .build()
            .context("Failed to build configuration")?;

        let parsed: ControllerConfig = config
            .try_deserialize()
            .context("Invalid controller configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.pass_timeout_secs == 0 {
            anyhow::bail!("pass_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            requeue_after: Duration::from_secs(self.requeue_after_secs),
            failure_backoff: Duration::from_secs(self.failure_backoff_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            conflict_retry: Duration::from_secs(self.conflict_retry_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}
