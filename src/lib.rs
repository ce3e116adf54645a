//! hotrod-client - asynchronous Hot Rod client core
//!
//! Operations are routed to the server owning the key's segment when the
//! cluster publishes a consistent hash, or spread by a per-cache balancer
//! otherwise. Each server gets a bounded connection pool and a single
//! operation channel; failed attempts are retried on other servers, and when
//! every initial server of the active cluster is unreachable the client
//! fails over to the next configured cluster.
pub mod cache;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod metrics;
pub mod operations;
pub mod protocol;
pub mod topology;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

pub use cache::{ClientListener, ListenerOptions, RemoteCache};
pub use config::Config;
pub use crate::core::{ClientIntelligence, Cluster, ServerAddress};
pub use dispatcher::{DispatcherSettings, OperationDispatcher};
pub use error::{HotRodError, HotRodResult};
pub use event::ClientEvent;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::DEFAULT_CLUSTER_NAME;
use crate::error::ConfigError;
use crate::metrics::{MetricsRegistry, NoopMetricsRegistry};
use crate::protocol::DEFAULT_CACHE_NAME;
use crate::transport::ActivationStep;

/// Connected client; dropping it stops all traffic
pub struct HotRodClient {
    dispatcher: Arc<OperationDispatcher>,
}

impl HotRodClient {
    pub fn builder() -> HotRodClientBuilder {
        HotRodClientBuilder::new()
    }

    /// Connect using a validated configuration
    pub async fn connect(config: &Config) -> HotRodResult<Self> {
        HotRodClientBuilder::from_config(config)?.build().await
    }

    /// Handle to the server's default cache
    pub fn default_cache(&self) -> RemoteCache {
        self.cache(DEFAULT_CACHE_NAME)
    }

    pub fn cache(&self, name: &str) -> RemoteCache {
        RemoteCache::new(name.to_string(), Arc::clone(&self.dispatcher))
    }

    /// Switch to a configured alternate cluster by name
    pub fn switch_to_cluster(&self, name: &str) -> bool {
        self.dispatcher.switch_to_cluster(name)
    }

    pub fn switch_to_default_cluster(&self) -> bool {
        self.dispatcher.switch_to_default_cluster()
    }

    pub fn dispatcher(&self) -> &Arc<OperationDispatcher> {
        &self.dispatcher
    }

    pub fn stop(&self) {
        self.dispatcher.stop();
    }
}

impl Drop for HotRodClient {
    fn drop(&mut self) {
        self.dispatcher.stop();
    }
}

/// Builds a [`HotRodClient`] from code or from a [`Config`]
pub struct HotRodClientBuilder {
    servers: Vec<ServerAddress>,
    intelligence: ClientIntelligence,
    clusters: Vec<Cluster>,
    settings: DispatcherSettings,
    metrics: Arc<dyn MetricsRegistry>,
}

impl Default for HotRodClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HotRodClientBuilder {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            intelligence: ClientIntelligence::default(),
            clusters: Vec::new(),
            settings: DispatcherSettings::default(),
            metrics: Arc::new(NoopMetricsRegistry),
        }
    }

    pub fn from_config(config: &Config) -> HotRodResult<Self> {
        config.validate()?;
        let main = config.main_cluster()?;
        Ok(Self {
            servers: main.initial_servers().to_vec(),
            intelligence: main.intelligence(),
            clusters: config.alternate_clusters()?,
            settings: DispatcherSettings::from_config(config)?,
            metrics: Arc::new(NoopMetricsRegistry),
        })
    }

    pub fn add_server(mut self, address: ServerAddress) -> Self {
        self.servers.push(address);
        self
    }

    pub fn intelligence(mut self, intelligence: ClientIntelligence) -> Self {
        self.intelligence = intelligence;
        self
    }

    /// Alternate cluster, tried in the order added
    pub fn add_cluster(mut self, cluster: Cluster) -> Self {
        self.clusters.push(cluster);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.settings.max_retries = max_retries;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.settings.socket_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.transport.connect_timeout = timeout;
        self
    }

    /// Appended after the built-in ping
    pub fn activation_step(mut self, step: Arc<dyn ActivationStep>) -> Self {
        self.settings.activation.push(step);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(mut self, settings: DispatcherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Create the client and open connections to the initial servers
    pub async fn build(self) -> HotRodResult<HotRodClient> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError("At least one server is required".to_string()).into());
        }
        let main = Cluster::new(DEFAULT_CLUSTER_NAME, self.servers, self.intelligence, None);
        info!(
            servers = ?main.initial_servers(),
            alternate_clusters = self.clusters.len(),
            "Starting Hot Rod client"
        );

        let dispatcher = OperationDispatcher::new(main, self.clusters, self.settings, self.metrics);
        dispatcher.start().await;
        Ok(HotRodClient { dispatcher })
    }
}
