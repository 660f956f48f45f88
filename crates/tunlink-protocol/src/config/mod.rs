//! Configuration parsing for tunlink
//!
//! The daemon reads a single TOML file. Every section is optional; omitted
//! sections fall back to the defaults documented on each field.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Top-level tunlink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Link deployment settings
    #[serde(default)]
    pub link: LinkSection,

    /// Addresses of this host
    #[serde(default)]
    pub host: HostSection,

    /// Static AWS identity overrides
    #[serde(default)]
    pub aws: AwsSection,

    /// Deploy/refresh loop timing
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

/// Cloud provider used for route advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// AWS VPC route tables
    #[default]
    Aws,
    /// No cloud routes are advertised
    None,
}

/// The `[link]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSection {
    /// Delete cloud routes when a link is torn down (default: false)
    #[serde(default)]
    pub delete_routes: bool,

    /// Skip the periodic advertisement refresh (default: false)
    #[serde(default)]
    pub disable_advertise_update: bool,

    /// Directory holding one ipsec conf per state
    #[serde(default = "default_ipsec_dir")]
    pub ipsec_dir: String,

    /// Main ipsec.conf that must include `ipsec_dir`
    #[serde(default = "default_ipsec_conf_path")]
    pub ipsec_conf_path: String,

    /// ipsec.secrets path
    #[serde(default = "default_ipsec_secrets_path")]
    pub ipsec_secrets_path: String,

    /// Route ledger file
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,

    /// Cloud provider (default: aws)
    #[serde(default)]
    pub provider: Provider,
}

fn default_ipsec_dir() -> String {
    "/etc/ipsec.tunlink".to_string()
}
fn default_ipsec_conf_path() -> String {
    "/etc/ipsec.conf".to_string()
}
fn default_ipsec_secrets_path() -> String {
    "/etc/ipsec.secrets".to_string()
}
fn default_ledger_path() -> String {
    "/var/lib/tunlink/routes.json".to_string()
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            delete_routes: false,
            disable_advertise_update: false,
            ipsec_dir: default_ipsec_dir(),
            ipsec_conf_path: default_ipsec_conf_path(),
            ipsec_secrets_path: default_ipsec_secrets_path(),
            ledger_path: default_ledger_path(),
            provider: Provider::default(),
        }
    }
}

/// The `[host]` section. Empty strings mean "unknown".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSection {
    /// Public address peers connect to
    #[serde(default)]
    pub public_address: String,

    /// Private address of the primary interface
    #[serde(default)]
    pub local_address: String,

    /// IPv6 address, if any
    #[serde(default)]
    pub address6: String,

    /// Interface carrying the default route (detected when empty)
    #[serde(default)]
    pub default_interface: String,
}

/// The `[aws]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsSection {
    /// Region, e.g. "us-east-1"
    #[serde(default)]
    pub region: String,

    /// VPC whose route tables are managed
    #[serde(default)]
    pub vpc_id: String,

    /// Instance to route through
    #[serde(default)]
    pub instance_id: String,

    /// Network interface to route through (wins over instance_id)
    #[serde(default)]
    pub interface_id: String,

    /// Named credentials profile passed to the aws command
    #[serde(default)]
    pub profile: String,
}

impl AwsSection {
    /// Returns true when enough is configured to skip metadata lookup
    pub fn is_complete(&self) -> bool {
        !self.region.is_empty()
            && !self.vpc_id.is_empty()
            && (!self.instance_id.is_empty() || !self.interface_id.is_empty())
    }
}

/// The `[scheduler]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Deploy loop poll interval in milliseconds (default: 10)
    #[serde(default = "default_deploy_poll_ms")]
    pub deploy_poll_ms: u64,

    /// Wait after a failed deploy before retrying, in milliseconds (default: 3000)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Seconds between advertisement refresh passes (default: 30)
    #[serde(default = "default_update_advertise_rate")]
    pub update_advertise_rate_secs: u64,

    /// Seconds until the first refresh after a successful deploy (default: 3)
    #[serde(default = "default_update_advertise_replay")]
    pub update_advertise_replay_secs: u64,

    /// Delay before each cloud route operation in milliseconds (default: 150)
    #[serde(default = "default_route_delay_ms")]
    pub route_delay_ms: u64,
}

fn default_deploy_poll_ms() -> u64 {
    10
}
fn default_retry_backoff_ms() -> u64 {
    3000
}
fn default_update_advertise_rate() -> u64 {
    30
}
fn default_update_advertise_replay() -> u64 {
    3
}
fn default_route_delay_ms() -> u64 {
    150
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            deploy_poll_ms: default_deploy_poll_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            update_advertise_rate_secs: default_update_advertise_rate(),
            update_advertise_replay_secs: default_update_advertise_replay(),
            route_delay_ms: default_route_delay_ms(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to parse a JSON state file
    #[error("Failed to parse state JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sched = &self.scheduler;
        if sched.deploy_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.deploy_poll_ms must be greater than zero".into(),
            ));
        }
        if sched.update_advertise_rate_secs == 0 || sched.update_advertise_replay_secs == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler advertise intervals must be greater than zero".into(),
            ));
        }

        for (name, value) in [
            ("host.public_address", &self.host.public_address),
            ("host.local_address", &self.host.local_address),
            ("host.address6", &self.host.address6),
        ] {
            if !value.is_empty() && value.parse::<IpAddr>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "{} '{}' is not an IP address",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("link.ipsec_dir", &self.link.ipsec_dir),
            ("link.ipsec_conf_path", &self.link.ipsec_conf_path),
            ("link.ipsec_secrets_path", &self.link.ipsec_secrets_path),
            ("link.ledger_path", &self.link.ledger_path),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(name.to_string()));
            }
        }

        Ok(())
    }
}
