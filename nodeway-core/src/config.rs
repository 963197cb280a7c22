use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::address::{split_host_port, EndpointUrl};
use crate::logging::{parse_log_level, LogFormat};

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub load_balancer: LoadBalancerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Bootstrap supervisor URL (`https://host:port`)
    pub server_url: String,
    /// Directory for load-balancer state files
    pub data_dir: String,
    /// Local port of the supervisor load-balancer; 0 picks an ephemeral port
    pub lb_server_port: u16,
    pub disable_load_balancer: bool,
    pub ipv6: bool,
    /// Port of the API server when it differs from the supervisor port
    pub api_server_port: Option<u16>,
    /// Fallback supervisor address (`host:port`)
    pub supervisor_default: Option<String>,
    /// Static membership applied at startup
    pub servers: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            data_dir: "/var/lib/nodeway/agent".to_string(),
            lb_server_port: 6444,
            disable_load_balancer: false,
            ipv6: false,
            api_server_port: None,
            supervisor_default: None,
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub dial_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    /// Consecutive failures before a server is marked failed
    pub failure_threshold: u32,
    /// TCP connect timeout for the built-in health probe
    pub probe_timeout_secs: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 5,
            health_check_interval_secs: 5,
            failure_threshold: 2,
            probe_timeout_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // NODEWAY_AGENT__SERVER_URL, NODEWAY_AGENT__SERVERS=a:1,b:1, ...
        builder = builder.add_source(
            Environment::with_prefix("NODEWAY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("agent.servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub const fn lb_enabled(&self) -> bool {
        !self.agent.disable_load_balancer
    }

    /// Check the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.agent.server_url.is_empty() {
            errors.push("agent.server_url is required".to_string());
        } else if let Err(e) = EndpointUrl::parse(&self.agent.server_url) {
            errors.push(format!("agent.server_url: {e}"));
        }

        if self.lb_enabled() && self.agent.data_dir.is_empty() {
            errors.push("agent.data_dir is required when the load-balancer is enabled".to_string());
        }

        if self.agent.api_server_port == Some(0) {
            errors.push("agent.api_server_port must not be 0".to_string());
        }

        if let Some(address) = &self.agent.supervisor_default {
            if let Err(e) = split_host_port(address) {
                errors.push(format!("agent.supervisor_default: {e}"));
            }
        }

        for address in &self.agent.servers {
            if let Err(e) = split_host_port(address) {
                errors.push(format!("agent.servers: {e}"));
            }
        }

        if self.load_balancer.dial_timeout_secs == 0 {
            errors.push("load_balancer.dial_timeout_secs must be greater than 0".to_string());
        }
        if self.load_balancer.health_check_interval_secs == 0 {
            errors.push("load_balancer.health_check_interval_secs must be greater than 0".to_string());
        }
        if self.load_balancer.failure_threshold == 0 {
            errors.push("load_balancer.failure_threshold must be greater than 0".to_string());
        }

        if let Err(e) = parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if let Err(e) = self.logging.format.parse::<LogFormat>() {
            errors.push(format!("logging.format: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
