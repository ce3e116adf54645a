//! Connections, pools and per-server operation channels
//!
//! Layering, bottom up:
//! - [`connection::WireConnection`] owns one socket, a single writer task and
//!   a reader task running the [`decoder::HeaderDecoder`]
//! - [`pool::ConnectionPool`] bounds and reuses connections to one address
//! - [`channel::OperationChannel`] queues operations for one address and
//!   drains them onto pooled connections
//! - [`handler::ChannelHandler`] keeps one channel per address
//!
//! Anything the transport learns that matters above it (topology pushes,
//! listener events, connection failures) is reported through
//! [`TransportEvents`].
pub mod activation;
pub mod channel;
pub mod connection;
pub mod decoder;
pub mod handler;
pub mod pool;

pub use activation::{ActivationStep, PingActivation};
pub use connection::WireConnection;

use std::time::Duration;

use crate::config::{Config, ExhaustedAction};
use crate::core::ServerAddress;
use crate::error::{ConfigError, HotRodError, HotRodResult};
use crate::event::{ClientEvent, CounterEvent};
use crate::protocol::{parse_protocol_version, TopologyUpdate};
use crate::topology::ClientTopology;

/// Socket level settings, resolved once from configuration and handed to
/// the connector
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    /// Close connections that stay silent this long with nothing in flight
    pub idle_timeout: Option<Duration>,
    pub tcp_no_delay: bool,
    pub tcp_keep_alive: bool,
    pub protocol_version: u8,
    /// Operations drained per write round
    pub batch_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            tcp_no_delay: true,
            tcp_keep_alive: false,
            protocol_version: crate::protocol::DEFAULT_PROTOCOL_VERSION,
            batch_size: 256,
        }
    }
}

impl TransportSettings {
    pub fn from_config(config: &Config) -> HotRodResult<Self> {
        let protocol_version = parse_protocol_version(&config.client.protocol_version).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "Unsupported protocol version: {}",
                config.client.protocol_version
            ))
        })?;
        let idle = config.connection_pool.min_evictable_idle_time_ms;
        Ok(Self {
            connect_timeout: Duration::from_millis(config.client.connect_timeout_ms),
            idle_timeout: if idle > 0 { Some(Duration::from_millis(idle)) } else { None },
            tcp_no_delay: config.client.tcp_no_delay,
            tcp_keep_alive: config.client.tcp_keep_alive,
            protocol_version,
            batch_size: config.client.batch_size,
        })
    }
}

/// Sizing and exhaustion behavior of one connection pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Negative means unbounded
    pub max_active: i32,
    pub exhausted_action: ExhaustedAction,
    /// `None` waits forever under [`ExhaustedAction::Wait`]
    pub max_wait: Option<Duration>,
    /// A connection carrying this many operations is skipped by acquire
    pub max_pending_requests: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_active: -1,
            exhausted_action: ExhaustedAction::Wait,
            max_wait: None,
            max_pending_requests: 5,
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        let pool = &config.connection_pool;
        Self {
            max_active: pool.max_active,
            exhausted_action: pool.exhausted_action,
            max_wait: if pool.max_wait_ms > 0 {
                Some(Duration::from_millis(pool.max_wait_ms))
            } else {
                None
            },
            max_pending_requests: pool.max_pending_requests.max(1),
        }
    }
}

/// Callbacks from the transport into the layer that owns it
pub(crate) trait TransportEvents: Send + Sync {
    /// Topology id and intelligence to write in the next header for a cache
    fn client_topology(&self, cache_name: &str) -> ClientTopology;

    fn receive_topology(&self, address: &ServerAddress, cache_name: &str, operation_id: u64, update: &TopologyUpdate);

    fn cache_event(&self, address: &ServerAddress, listener_id: &[u8], event: ClientEvent);

    fn counter_event(&self, event: CounterEvent);

    /// A connection that carried client listeners closed
    fn listeners_lost(&self, address: &ServerAddress);

    fn connection_established(&self, address: &ServerAddress);

    fn connection_failed(&self, address: &ServerAddress, error: &HotRodError);

    /// The last connection to `address` closed because of `cause`
    fn connection_closed(&self, address: &ServerAddress, cause: &HotRodError);
}
