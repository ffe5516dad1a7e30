//! ShardFollow Configuration
//!
//! This module provides configuration structures for a shardfollow node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::follow::FollowParameters;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node-specific configuration
    pub node: NodeSection,

    /// Defaults for every follow relationship created on this node
    #[serde(default)]
    pub follow: FollowParameters,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Unique node identifier
    pub id: String,

    /// Data directory for checkpoint storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:9280".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/shardfollow")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl NodeConfig {
    /// Build a configuration with all defaults for the given node id
    pub fn with_node_id(id: impl Into<String>) -> Self {
        Self {
            node: NodeSection {
                id: id.into(),
                data_dir: default_data_dir(),
            },
            follow: FollowParameters::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to render config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }

        self.follow
            .validate()
            .map_err(|e| crate::Error::Config(format!("follow: {}", e)))?;

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the checkpoint state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
data_dir = "/tmp/shardfollow"

[follow]
max_read_request_operation_count = 100
max_outstanding_read_requests = 2
read_poll_timeout_ms = 50

[api]
bind_address = "127.0.0.1:9280"
"#;

        let config = NodeConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.follow.max_read_request_operation_count, 100);
        assert_eq!(config.follow.max_outstanding_read_requests, 2);
        assert_eq!(config.follow.read_poll_timeout_ms, 50);
        // Unset follow values keep their defaults
        assert_eq!(
            config.follow.max_write_buffer_count,
            FollowParameters::default().max_write_buffer_count
        );
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/shardfollow/state"));
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_rejects_bad_follow_defaults() {
        let toml = r#"
[node]
id = "node-1"

[follow]
max_outstanding_read_requests = 0
"#;
        assert!(NodeConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let config = NodeConfig::with_node_id("node-7");
        let rendered = config.to_toml().unwrap();
        let parsed = NodeConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.node.id, "node-7");
        assert_eq!(parsed.api.bind_address, config.api.bind_address);
    }
}
