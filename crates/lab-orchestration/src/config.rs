//! Agent configuration
//!
//! Loaded from YAML. Every field except `host` has a default, so the
//! smallest valid file is a single line:
//!
//! ```yaml
//! host: agent-01.range.example
//! ```

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use range_network::{VpnAddressPool, host_range};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Largest team a single VPN lab may be configured for
pub const MAX_TEAM_SIZE: u8 = 8;

/// Where registry snapshots are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON file replaced atomically on every save
    #[default]
    File,
    /// Embedded sled database
    Sled,
}

impl fmt::Display for StateBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateBackend::File => f.write_str("file"),
            StateBackend::Sled => f.write_str("sled"),
        }
    }
}

impl FromStr for StateBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(StateBackend::File),
            "sled" => Ok(StateBackend::Sled),
            other => Err(Error::Validation(format!(
                "unknown state backend '{}', expected 'file' or 'sled'",
                other
            ))),
        }
    }
}

/// Agent process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Public host name, written into VPN client configs as the endpoint
    pub host: String,

    /// Range VPN endpoint subnets are carved from (derived from `host` if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_range: Option<Ipv4Net>,

    /// Prefix length of each environment's VPN subnet
    #[serde(default = "default_vpn_subnet_prefix")]
    pub vpn_subnet_prefix: u8,

    /// Snapshot location (platform data directory if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,

    /// Snapshot storage backend
    #[serde(default)]
    pub state_backend: StateBackend,

    /// Provisioning workers per environment
    #[serde(default = "default_workers_per_environment")]
    pub workers_per_environment: usize,

    /// Agent-wide lab teardown workers
    #[serde(default = "default_teardown_workers")]
    pub teardown_workers: usize,

    /// Pending task limit of each worker pool
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,

    /// Lab stream buffer size before the oldest events are dropped
    #[serde(default = "default_lab_stream_capacity")]
    pub lab_stream_capacity: usize,

    /// VPN endpoint port used when a request does not name one
    #[serde(default = "default_vpn_port")]
    pub default_vpn_port: u16,

    /// Team size used when a request does not name one
    #[serde(default = "default_team_size")]
    pub default_team_size: u8,
}

fn default_vpn_subnet_prefix() -> u8 {
    range_network::vpn_pool::DEFAULT_SUBNET_PREFIX
}

fn default_workers_per_environment() -> usize {
    5
}

fn default_teardown_workers() -> usize {
    2
}

fn default_task_queue_capacity() -> usize {
    64
}

fn default_lab_stream_capacity() -> usize {
    128
}

fn default_vpn_port() -> u16 {
    51820
}

fn default_team_size() -> u8 {
    1
}

impl AgentConfig {
    /// Configuration with every default applied
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            vpn_range: None,
            vpn_subnet_prefix: default_vpn_subnet_prefix(),
            state_path: None,
            state_backend: StateBackend::default(),
            workers_per_environment: default_workers_per_environment(),
            teardown_workers: default_teardown_workers(),
            task_queue_capacity: default_task_queue_capacity(),
            lab_stream_capacity: default_lab_stream_capacity(),
            default_vpn_port: default_vpn_port(),
            default_team_size: default_team_size(),
        }
    }

    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML configuration from a string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AgentConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Effective VPN range
    pub fn vpn_range(&self) -> Ipv4Net {
        self.vpn_range.unwrap_or_else(|| host_range(&self.host))
    }

    /// Effective snapshot location
    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("range-agent")
                .join("state")
        })
    }

    /// Build the agent's VPN address pool
    pub fn vpn_pool(&self) -> Result<VpnAddressPool> {
        Ok(VpnAddressPool::new(self.vpn_range(), self.vpn_subnet_prefix)?)
    }

    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Validation("host must not be empty".to_string()));
        }

        let range = self.vpn_range();
        if self.vpn_subnet_prefix < range.prefix_len() || self.vpn_subnet_prefix > 30 {
            return Err(Error::Validation(format!(
                "vpn_subnet_prefix /{} does not fit vpn_range {}",
                self.vpn_subnet_prefix, range
            )));
        }

        // Zero-sized pools and queues would reject every request
        for (name, value) in [
            ("workers_per_environment", self.workers_per_environment),
            ("teardown_workers", self.teardown_workers),
            ("task_queue_capacity", self.task_queue_capacity),
            ("lab_stream_capacity", self.lab_stream_capacity),
        ] {
            if value == 0 {
                return Err(Error::Validation(format!("{} must be at least 1", name)));
            }
        }

        if self.default_vpn_port == 0 {
            return Err(Error::Validation(
                "default_vpn_port must not be 0".to_string(),
            ));
        }

        if self.default_team_size == 0 || self.default_team_size > MAX_TEAM_SIZE {
            return Err(Error::Validation(format!(
                "default_team_size must be between 1 and {}, got {}",
                MAX_TEAM_SIZE, self.default_team_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AgentConfig::from_yaml("host: agent-01.range.example\n").unwrap();

        assert_eq!(config, AgentConfig::new("agent-01.range.example"));
        assert_eq!(config.workers_per_environment, 5);
        assert_eq!(config.default_vpn_port, 51820);
        assert_eq!(config.state_backend, StateBackend::File);
        assert_eq!(config.vpn_range(), host_range("agent-01.range.example"));
        assert!(config.state_path().ends_with("range-agent/state"));
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
host: 203.0.113.10
vpn_range: 10.77.0.0/16
vpn_subnet_prefix: 26
state_path: /var/lib/range-agent/state
state_backend: sled
workers_per_environment: 3
teardown_workers: 1
task_queue_capacity: 16
lab_stream_capacity: 32
default_vpn_port: 5000
default_team_size: 4
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.vpn_range().to_string(), "10.77.0.0/16");
        assert_eq!(config.state_backend, StateBackend::Sled);
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/range-agent/state"));
        assert_eq!(config.vpn_pool().unwrap().capacity(), 1024);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "host: ''\n",
            "host: a\nvpn_range: 10.1.0.0/16\nvpn_subnet_prefix: 8\n",
            "host: a\nworkers_per_environment: 0\n",
            "host: a\ndefault_team_size: 9\n",
            "host: a\ndefault_vpn_port: 0\n",
        ];

        for yaml in cases {
            let result = AgentConfig::from_yaml(yaml);
            assert!(matches!(result, Err(Error::Validation(_))), "accepted: {}", yaml);
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = AgentConfig::from_yaml("host: a\nworker_count: 3\n");
        assert!(matches!(result, Err(Error::Yaml(_))));
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("sled".parse::<StateBackend>().unwrap(), StateBackend::Sled);
        assert!("postgres".parse::<StateBackend>().is_err());
    }
}
