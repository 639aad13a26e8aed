//! Operator configuration
//!
//! Values come from three layers, later ones winning: built-in defaults, an
//! optional TOML file (`--config`), then command line flags and their
//! environment variables. The resulting [`OperatorConfig`] is handed to every
//! loop explicitly.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::annotations::DEFAULT_DOMAIN;
use crate::checkly::DEFAULT_API_URL;
use crate::controller::finalizer_name;
use crate::controller::LoopConfig;
use crate::error::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Domain of the annotations, labels and finalizer owned by the operator
    pub controller_domain: String,
    pub api_url: String,
    pub leader_elect: bool,
    /// Namespace holding the leader election lease
    pub namespace: String,
    pub health_probe_bind_address: String,
    /// Parallel reconciles per controller
    pub concurrency: u16,
    /// Seconds between periodic resyncs of every object
    pub resync_interval: u64,
    /// Seconds to wait before retrying an object with unsynced references
    pub dependency_retry: u64,
    pub max_conflict_retries: u32,
    /// Seconds between full sweeps of derived checks
    pub sweep_interval: u64,
    /// Locations used by checks that name neither locations nor a group
    pub default_locations: Vec<String>,
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            controller_domain: DEFAULT_DOMAIN.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            leader_elect: false,
            namespace: "default".to_string(),
            health_probe_bind_address: "0.0.0.0:8081".to_string(),
            concurrency: 4,
            resync_interval: 300,
            dependency_retry: 30,
            max_conflict_retries: 3,
            sweep_interval: 300,
            default_locations: vec!["eu-west-1".to_string()],
            log_format: LogFormat::Text,
        }
    }
}

impl OperatorConfig {
    /// Parse a TOML configuration file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw).map_err(|e| {
            Error::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Defaults, then the file if given, then flags
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = match overrides.config.as_deref() {
            Some(path) => Self::from_file(Path::new(path))?,
            None => Self::default(),
        };
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller_domain.is_empty() || self.controller_domain.contains('/') {
            return Err(Error::ConfigError(format!(
                "controller domain {:?} must be a non-empty DNS name",
                self.controller_domain
            )));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(Error::ConfigError(format!(
                "api url {:?} must be an http(s) URL",
                self.api_url
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::ConfigError("concurrency must be at least 1".to_string()));
        }
        if self.resync_interval == 0 || self.sweep_interval == 0 {
            return Err(Error::ConfigError(
                "resync and sweep intervals must be positive".to_string(),
            ));
        }
        if self.default_locations.is_empty() {
            return Err(Error::ConfigError(
                "at least one default location is required".to_string(),
            ));
        }
        self.probe_address()?;
        Ok(())
    }

    pub fn probe_address(&self) -> Result<SocketAddr> {
        self.health_probe_bind_address.parse().map_err(|e| {
            Error::ConfigError(format!(
                "invalid health probe address {:?}: {}",
                self.health_probe_bind_address, e
            ))
        })
    }

    pub fn finalizer_name(&self) -> String {
        finalizer_name(&self.controller_domain)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    /// Settings shared by the three reconcile loops
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            finalizer: self.finalizer_name(),
            resync_interval: Duration::from_secs(self.resync_interval),
            dependency_retry: Duration::from_secs(self.dependency_retry),
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

/// Command line flags; each one overrides the file value when given
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// TOML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Domain used for annotations, labels and the finalizer
    #[arg(long, env = "CONTROLLER_DOMAIN")]
    pub controller_domain: Option<String>,

    /// Base URL of the Checkly public API
    #[arg(long, env = "CHECKLY_API_URL")]
    pub api_url: Option<String>,

    /// Only run controllers while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Operator namespace
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    pub namespace: Option<String>,

    /// Address of the health, metrics and status server
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS")]
    pub health_probe_bind_address: Option<String>,

    /// Parallel reconciles per controller
    #[arg(long, env = "CONCURRENCY")]
    pub concurrency: Option<u16>,

    /// Seconds between periodic resyncs
    #[arg(long, env = "RESYNC_INTERVAL")]
    pub resync_interval: Option<u64>,

    /// Default check location, repeatable
    #[arg(long = "default-location")]
    pub default_locations: Vec<String>,

    #[arg(long, value_enum, env = "LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut OperatorConfig) {
        if let Some(domain) = &self.controller_domain {
            config.controller_domain = domain.clone();
        }
        if let Some(url) = &self.api_url {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if self.leader_elect {
            config.leader_elect = true;
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(addr) = &self.health_probe_bind_address {
            config.health_probe_bind_address = addr.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(resync) = self.resync_interval {
            config.resync_interval = resync;
        }
        if !self.default_locations.is_empty() {
            config.default_locations = self.default_locations.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}
