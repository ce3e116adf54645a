/// Configuration management for the Hot Rod client

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::core::balancer::BalancingStrategy;
use crate::core::{ClientIntelligence, Cluster, ServerAddress, DEFAULT_CLUSTER_NAME};
use crate::protocol::parse_protocol_version;

pub use crate::error::ConfigError;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Initial servers and request behavior
    pub client: ClientConfig,
    /// Alternate clusters for cross-site failover
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Per-server connection pool configuration
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Initial servers of the main cluster, `host:port`
    pub servers: Vec<String>,
    /// Retries per operation after the first attempt
    pub max_retries: u32,
    pub intelligence: ClientIntelligence,
    /// Hot Rod protocol version ("2.8", "3.0" or "3.1")
    pub protocol_version: String,
    pub balancing_strategy: BalancingStrategy,
    /// How long a server that failed to connect is skipped, in milliseconds
    pub server_failure_timeout_ms: u64,
    /// Response timeout per attempt in milliseconds
    pub socket_timeout_ms: u64,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    pub tcp_no_delay: bool,
    pub tcp_keep_alive: bool,
    /// Operations written per batch
    pub batch_size: usize,
    pub sni_host_name: Option<String>,
}

/// Alternate cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub servers: Vec<String>,
    /// Defaults to the client intelligence
    pub intelligence: Option<ClientIntelligence>,
    pub sni_host_name: Option<String>,
}

/// What acquire does when a pool is at `max_active`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExhaustedAction {
    /// Fail immediately
    Exception,
    /// Queue until a connection frees up or `max_wait_ms` passes
    Wait,
    /// Open another connection regardless of the limit
    CreateNew,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Connections per server, -1 for unbounded
    pub max_active: i32,
    /// Operations in flight on one connection before another is used
    pub max_pending_requests: usize,
    /// Wait limit under WAIT in milliseconds, 0 waits forever
    pub max_wait_ms: u64,
    pub exhausted_action: ExhaustedAction,
    /// Idle connections are closed after this many milliseconds, 0 disables
    pub min_evictable_idle_time_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:11222".to_string()],
            max_retries: 3,
            intelligence: ClientIntelligence::HashDistributionAware,
            protocol_version: "3.1".to_string(),
            balancing_strategy: BalancingStrategy::RoundRobin,
            server_failure_timeout_ms: 10_000,
            socket_timeout_ms: 60_000,
            connect_timeout_ms: 60_000,
            tcp_no_delay: true,
            tcp_keep_alive: false,
            batch_size: 256,
            sni_host_name: None,
        }
    }
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_active: -1,
            max_pending_requests: 5,
            max_wait_ms: 0,
            exhausted_action: ExhaustedAction::Wait,
            min_evictable_idle_time_ms: 30 * 60 * 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            clusters: Vec::new(),
            connection_pool: ConnectionPoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_servers(servers: &[String]) -> Result<Vec<ServerAddress>, ConfigError> {
    servers.iter().map(|server| server.parse::<ServerAddress>()).collect()
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "client servers cannot be empty".to_string(),
            ));
        }
        parse_servers(&self.client.servers)?;

        if parse_protocol_version(&self.client.protocol_version).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "Unsupported protocol version: {}",
                self.client.protocol_version
            )));
        }

        if self.client.socket_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "socket_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.client.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.client.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        // Cluster names must be unique and must not shadow the main cluster
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() || cluster.name == DEFAULT_CLUSTER_NAME {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid cluster name: '{}'",
                    cluster.name
                )));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate cluster name: {}",
                    cluster.name
                )));
            }
            if cluster.servers.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Cluster {} has no servers",
                    cluster.name
                )));
            }
            parse_servers(&cluster.servers)?;
        }

        if self.connection_pool.max_active == 0 || self.connection_pool.max_active < -1 {
            return Err(ConfigError::ValidationError(
                "max_active must be -1 (unbounded) or greater than 0".to_string(),
            ));
        }

        if self.connection_pool.max_pending_requests == 0 {
            return Err(ConfigError::ValidationError(
                "max_pending_requests must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Cluster built from `[client].servers`
    pub fn main_cluster(&self) -> Result<Cluster, ConfigError> {
        Ok(Cluster::new(
            DEFAULT_CLUSTER_NAME,
            parse_servers(&self.client.servers)?,
            self.client.intelligence,
            self.client.sni_host_name.clone(),
        ))
    }

    /// Alternate clusters in declaration order
    pub fn alternate_clusters(&self) -> Result<Vec<Cluster>, ConfigError> {
        self.clusters
            .iter()
            .map(|cluster| {
                Ok(Cluster::new(
                    cluster.name.clone(),
                    parse_servers(&cluster.servers)?,
                    cluster.intelligence.unwrap_or(self.client.intelligence),
                    cluster.sni_host_name.clone(),
                ))
            })
            .collect()
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "single" => Config {
                client: ClientConfig {
                    servers: vec![
                        "10.0.1.10:11222".to_string(),
                        "10.0.1.11:11222".to_string(),
                        "10.0.1.12:11222".to_string(),
                    ],
                    ..Default::default()
                },
                ..Default::default()
            },
            "xsite" => Config {
                client: ClientConfig {
                    servers: vec![
                        "10.0.1.10:11222".to_string(),
                        "10.0.1.11:11222".to_string(),
                    ],
                    ..Default::default()
                },
                clusters: vec![ClusterConfig {
                    name: "site-b".to_string(),
                    servers: vec![
                        "10.0.2.10:11222".to_string(),
                        "10.0.2.11:11222".to_string(),
                    ],
                    intelligence: None,
                    sni_host_name: None,
                }],
                ..Default::default()
            },
            _ => return Err(ConfigError::ValidationError(
                "Mode must be 'single' or 'xsite'".to_string(),
            )),
        };

        config.save_to_file(path)
    }
}
