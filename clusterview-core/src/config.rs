use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{Credentials, Endpoint};
use crate::poller::PollPolicy;
use crate::resilience::timeout::TimeoutConfig;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub poll: PollConfig,
    pub management: ManagementConfig,
    pub aggregation: AggregationConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
    pub peers: PeersConfig,
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

/// Retry budget for verifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub timeout_seconds: u64,
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            poll_interval_ms: 10_000,
            timeout_seconds: 300,
            max_attempts: None,
        }
    }
}

impl PollConfig {
    #[must_use]
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_secs(self.timeout_seconds),
            max_attempts: self.max_attempts,
        }
    }
}

/// Connection settings for member management endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    pub scheme: String,
    pub connect_timeout_seconds: u64,
    pub query_timeout_seconds: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            connect_timeout_seconds: 5,
            query_timeout_seconds: 10,
            username: None,
            password: None,
        }
    }
}

impl ManagementConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub const fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    /// Credentials, when both a username and a password are configured
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some(Credentials::new(user, password)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub max_concurrency: usize,
    pub tolerate_unknown: bool,
    pub probe_registry: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            tolerate_unknown: false,
            probe_registry: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: String, // "memory" or "redis"
    pub url: String,
    pub key_prefix: String,
    pub operation_timeout_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            url: "redis://localhost:6379".to_string(),
            key_prefix: "clusterview:registry:".to_string(),
            operation_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Members to inspect
///
/// Either list `endpoints` directly (`host:port` or `name=host:port`) or give a
/// `domain_uid` plus `servers`, which are addressed as `<domain_uid>-<server>:<port>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    pub endpoints: Vec<String>,
    pub domain_uid: Option<String>,
    pub servers: Vec<String>,
    pub port: u16,
    pub expected_members: Vec<String>,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            domain_uid: None,
            servers: Vec::new(),
            port: 8001,
            expected_members: Vec::new(),
        }
    }
}

impl PeersConfig {
    /// Resolve the configured peers, attaching `credentials` to each
    pub fn resolve(&self, credentials: Option<&Credentials>) -> Result<Vec<Endpoint>> {
        let mut endpoints = self
            .endpoints
            .iter()
            .map(|spec| spec.parse::<Endpoint>())
            .collect::<Result<Vec<_>>>()?;

        if let Some(domain) = &self.domain_uid {
            endpoints.extend(
                self.servers
                    .iter()
                    .map(|server| Endpoint::domain_member(domain, server, self.port)),
            );
        } else if !self.servers.is_empty() {
            return Err(Error::Configuration(
                "peers.servers requires peers.domain_uid".to_string(),
            ));
        }

        Ok(endpoints
            .into_iter()
            .map(|endpoint| match credentials {
                Some(creds) if endpoint.credentials.is_none() => endpoint.with_credentials(creds.clone()),
                _ => endpoint,
            })
            .collect())
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CLUSTERVIEW_POLL__TIMEOUT_SECONDS, CLUSTERVIEW_PEERS__ENDPOINTS=a:1,b:2
        builder = builder.add_source(
            Environment::with_prefix("CLUSTERVIEW")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("peers.endpoints")
                .with_list_parse_key("peers.servers")
                .with_list_parse_key("peers.expected_members")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Check the loaded values, collecting every problem found
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.poll.policy().validate() {
            errors.push(e.to_string());
        }
        if self.management.connect_timeout_seconds == 0 {
            errors.push("management.connect_timeout_seconds must be greater than zero".to_string());
        }
        if self.management.query_timeout_seconds == 0 {
            errors.push("management.query_timeout_seconds must be greater than zero".to_string());
        }
        if !matches!(self.management.scheme.as_str(), "http" | "https") {
            errors.push(format!(
                "management.scheme must be http or https, got '{}'",
                self.management.scheme
            ));
        }
        if self.management.username.is_some() != self.management.password.is_some() {
            errors.push("management.username and management.password must be set together".to_string());
        }
        if self.aggregation.max_concurrency == 0 {
            errors.push("aggregation.max_concurrency must be greater than zero".to_string());
        }
        match self.registry.backend.as_str() {
            "memory" => {}
            "redis" if self.registry.url.is_empty() => {
                errors.push("registry.url is required for the redis backend".to_string());
            }
            "redis" => {}
            other => errors.push(format!("registry.backend must be memory or redis, got '{other}'")),
        }
        if let Err(e) = self.peers.resolve(None) {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Connect, query and registry timeouts from their sections
    #[must_use]
    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig::new()
            .with_connect_timeout(self.management.connect_timeout())
            .with_query_timeout(self.management.query_timeout())
            .with_registry_timeout(Duration::from_secs(self.registry.operation_timeout_seconds))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
