//! Core abstractions shared by the transport, topology and dispatcher layers
pub mod balancer;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ConfigError;

/// Name reserved for the cluster built from `[client].servers`
pub const DEFAULT_CLUSTER_NAME: &str = "___DEFAULT-CLUSTER___";

/// Host and port of a cluster node.
///
/// Addresses are never resolved eagerly: DNS lookup happens when a
/// connection is opened, so identity stays stable across resolution changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: Arc<str>,
    port: u16,
}

impl ServerAddress {
    pub fn new<S: AsRef<str>>(host: S, port: u16) -> Self {
        Self {
            host: Arc::from(host.as_ref()),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ConfigError;

    /// Parse `host:port`, `[ipv6]:port` or a bare host (default port 11222)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::ValidationError(
                "Server address cannot be empty".to_string(),
            ));
        }

        let invalid = || ConfigError::ValidationError(format!("Invalid server address: {}", s));

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            return Ok(ServerAddress::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Err(invalid()),
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(ServerAddress::new(host, port))
            }
            Some(_) => Err(invalid()),
            None => Ok(ServerAddress::new(s, DEFAULT_PORT)),
        }
    }
}

/// Default Hot Rod port
pub const DEFAULT_PORT: u16 = 11222;

/// How much topology awareness the client asks the server for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientIntelligence {
    /// No topology information at all
    Basic,
    /// Server list updates only
    TopologyAware,
    /// Server list plus segment ownership
    HashDistributionAware,
}

impl ClientIntelligence {
    /// Byte sent in every request header
    pub fn value(self) -> u8 {
        match self {
            ClientIntelligence::Basic => 0x01,
            ClientIntelligence::TopologyAware => 0x02,
            ClientIntelligence::HashDistributionAware => 0x03,
        }
    }
}

impl Default for ClientIntelligence {
    fn default() -> Self {
        ClientIntelligence::HashDistributionAware
    }
}

/// A named set of initial servers. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    name: String,
    initial_servers: Vec<ServerAddress>,
    intelligence: ClientIntelligence,
    sni_host_name: Option<String>,
}

impl Cluster {
    pub fn new<S: Into<String>>(
        name: S,
        initial_servers: Vec<ServerAddress>,
        intelligence: ClientIntelligence,
        sni_host_name: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            initial_servers,
            intelligence,
            sni_host_name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_servers(&self) -> &[ServerAddress] {
        &self.initial_servers
    }

    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    pub fn sni_host_name(&self) -> Option<&str> {
        self.sni_host_name.as_deref()
    }
}
