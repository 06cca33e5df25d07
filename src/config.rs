//! Configuration parsing and management

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

pub const DEFAULT_INSTANCE_TIMEOUT: u64 = 300;
pub const MIN_INSTANCE_TIMEOUT: u64 = 30;
pub const MAX_TIMEOUT: u64 = 3600;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named proxy instances
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address to bind the gateway server
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Include token values in the /debug endpoint output
    #[serde(default)]
    pub expose_tokens: bool,

    /// Path to PEM CA cert to trust for upstream TLS (testing only)
    #[serde(default)]
    pub upstream_tls_ca: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            expose_tokens: false,
            upstream_tls_ca: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log admitted requests
    #[serde(default = "default_true")]
    pub log_allowed_requests: bool,

    /// Whether to log denied requests
    #[serde(default = "default_true")]
    pub log_blocked_requests: bool,

    /// Path to a JSONL audit log of admission decisions
    #[serde(default)]
    pub audit_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_allowed_requests: true,
            log_blocked_requests: true,
            audit_log: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Outbound destination restriction mode for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundMode {
    /// Any destination
    Any,
    /// Public addresses only
    External,
    /// Private and loopback addresses only
    Internal,
    /// Destinations inside `restrict_out_cidrs` only
    Cidr,
}

/// A single named proxy instance.
///
/// Immutable after load; reconfiguration replaces the whole registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Instance name (injected from the map key at load time)
    #[serde(skip)]
    pub name: String,

    /// Accepted authentication tokens. Empty means no token is required.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Outbound destination restriction
    #[serde(default = "default_restrict_out")]
    pub restrict_out: OutboundMode,

    /// CIDR allowlist for `restrict_out = "cidr"`
    #[serde(default)]
    pub restrict_out_cidrs: Vec<IpNet>,

    /// Client source CIDR allowlist. Empty admits any source.
    #[serde(default)]
    pub restrict_in_cidrs: Vec<IpNet>,

    /// Default upstream timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whether the embedding host framework's own auth is also required
    #[serde(default)]
    pub requires_auth: bool,
}

fn default_restrict_out() -> OutboundMode {
    OutboundMode::Any
}

fn default_timeout() -> u64 {
    DEFAULT_INSTANCE_TIMEOUT
}

impl InstanceConfig {
    /// Build an instance with the given name and defaults everywhere else.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tokens: Vec::new(),
            restrict_out: OutboundMode::Any,
            restrict_out_cidrs: Vec::new(),
            restrict_in_cidrs: Vec::new(),
            timeout: DEFAULT_INSTANCE_TIMEOUT,
            requires_auth: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a JSON string
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(content)
            .map_err(|e| Error::config(format!("Invalid JSON: {}", e)))?;

        // Inject map keys as instance names, then validate
        for (name, instance) in config.instances.iter_mut() {
            instance.name = name.clone();
        }
        for (name, instance) in &config.instances {
            Self::validate_instance(name, instance)?;
        }

        Ok(config)
    }

    /// Validate a single instance for consistency
    fn validate_instance(name: &str, instance: &InstanceConfig) -> Result<()> {
        let ctx = |msg: &str| Error::config(format!("Instance '{}': {}", name, msg));

        if name.is_empty() {
            return Err(Error::config("Instance name must not be empty"));
        }
        if name == "debug" {
            return Err(ctx("the name \"debug\" is reserved for the debug endpoint"));
        }
        if name.contains('/') {
            return Err(ctx("name must not contain '/'"));
        }

        if instance.timeout < MIN_INSTANCE_TIMEOUT || instance.timeout > MAX_TIMEOUT {
            return Err(ctx(&format!(
                "timeout must be between {} and {} seconds",
                MIN_INSTANCE_TIMEOUT, MAX_TIMEOUT
            )));
        }

        match instance.restrict_out {
            OutboundMode::Cidr => {
                if instance.restrict_out_cidrs.is_empty() {
                    return Err(ctx(
                        "restrict_out = \"cidr\" requires a non-empty restrict_out_cidrs",
                    ));
                }
            }
            _ => {
                if !instance.restrict_out_cidrs.is_empty() {
                    return Err(ctx(
                        "restrict_out_cidrs is only valid with restrict_out = \"cidr\"",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Create a minimal configuration with a single unrestricted instance
    pub fn minimal(listen: String, instance_name: &str) -> Self {
        let mut instances = HashMap::new();
        instances.insert(
            instance_name.to_string(),
            InstanceConfig::named(instance_name),
        );
        Self {
            server: ServerConfig {
                listen,
                expose_tokens: false,
                upstream_tls_ca: None,
            },
            logging: LoggingConfig::default(),
            instances,
        }
    }
}
