//! Engine configuration
//!
//! ```toml
//! [group_policy]
//! policy_drivers = ["mapping"]
//!
//! [group_policy_mapping]
//! default_l3_context_name = "default"
//! default_ip_version = 4
//! default_ip_pool = "172.16.0.0/12"
//! default_subnet_prefix_length = 26
//! ```

use gbp_common::GbpError;
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Driver names understood by the driver manager
pub const KNOWN_DRIVERS: &[&str] = &["mapping", "noop"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for GbpError {
    fn from(e: ConfigError) -> Self {
        GbpError::Config(e.to_string())
    }
}

/// Defaults for implicitly created L3 contexts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Name of the per-tenant L3 context used when an L2 context has none
    pub default_l3_context_name: String,
    pub default_ip_version: u8,
    pub default_ip_pool: IpNetwork,
    pub default_subnet_prefix_length: u8,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            default_l3_context_name: "default".into(),
            default_ip_version: 4,
            default_ip_pool: default_ip_pool(),
            default_subnet_prefix_length: 26,
        }
    }
}

fn default_ip_pool() -> IpNetwork {
    let base = Ipv4Addr::new(172, 16, 0, 0);
    Ipv4Network::new(base, 12)
        .map(IpNetwork::V4)
        .unwrap_or(IpNetwork::V4(base.into()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicyConfig {
    /// Drivers in call order
    pub policy_drivers: Vec<String>,
}

impl Default for GroupPolicyConfig {
    fn default() -> Self {
        Self {
            policy_drivers: vec!["mapping".into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub group_policy: GroupPolicyConfig,
    pub group_policy_mapping: MappingConfig,
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in &self.group_policy.policy_drivers {
            if !KNOWN_DRIVERS.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!("unknown policy driver '{}'", name)));
            }
        }

        let mapping = &self.group_policy_mapping;
        if mapping.default_l3_context_name.trim().is_empty() {
            return Err(ConfigError::Invalid("default_l3_context_name is empty".into()));
        }
        let (version, width) = match mapping.default_ip_pool {
            IpNetwork::V4(_) => (4, 32),
            IpNetwork::V6(_) => (6, 128),
        };
        if mapping.default_ip_version != version {
            return Err(ConfigError::Invalid(format!(
                "default_ip_pool {} is not an IPv{} network",
                mapping.default_ip_pool, mapping.default_ip_version
            )));
        }
        let prefix = mapping.default_subnet_prefix_length;
        if prefix < mapping.default_ip_pool.prefix() || prefix > width {
            return Err(ConfigError::Invalid(format!(
                "default_subnet_prefix_length {} does not fit {}",
                prefix, mapping.default_ip_pool
            )));
        }
        Ok(())
    }
}
