//! Configuration for the operator.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub const TEMPLATE_FILE_ENV: &str = "KEEPALIVEDGROUP_TEMPLATE_FILE_NAME";
pub const IMAGE_ENV: &str = "KEEPALIVED_OPERATOR_IMAGE_NAME";
pub const LOG_LEVEL_ENV: &str = "KEEPALIVED_LOG_LEVEL";
pub const WORKERS_ENV: &str = "KEEPALIVED_WORKERS";

pub const DEFAULT_TEMPLATE_FILE: &str = "/etc/templates/job.template.yaml";
pub const DEFAULT_OPERATOR_IMAGE: &str = "quay.io/redhat-cop/keepalived-operator:latest";

/// Operator configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Template rendered for every group.
    pub template_file: PathBuf,

    /// Operator image, exposed to the template as `Misc.image`.
    pub image: String,

    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Number of groups reconciled concurrently.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            template_file: PathBuf::from(DEFAULT_TEMPLATE_FILE),
            image: DEFAULT_OPERATOR_IMAGE.to_string(),
            log_level: "info".to_string(),
            workers: 2,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let template_file = lookup(TEMPLATE_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or(defaults.template_file);

        let image = lookup(IMAGE_ENV).unwrap_or(defaults.image);

        let log_level = lookup(LOG_LEVEL_ENV).unwrap_or(defaults.log_level);

        let workers = match lookup(WORKERS_ENV) {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .with_context(|| format!("{WORKERS_ENV} must be a positive integer, got {raw:?}"))?,
            None => defaults.workers,
        };

        Ok(Self {
            template_file,
            image,
            log_level,
            workers,
        })
    }
}

/// Everything a reconcile pass needs besides the store: static configuration
/// plus facts discovered once at startup.
#[derive(Debug, Clone, Default)]
pub struct OperatorContext {
    pub config: Config,

    /// Whether the cluster serves `monitoring.coreos.com/v1` PodMonitors.
    pub supports_pod_monitor: bool,
}

impl OperatorContext {
    pub fn new(config: Config, supports_pod_monitor: bool) -> Self {
        Self {
            config,
            supports_pod_monitor,
        }
    }
}
