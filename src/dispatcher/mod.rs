//! Operation routing, retries and cluster failover
//!
//! The [`OperationDispatcher`] picks a server for each operation (segment
//! owner first, then the cache's balancer), hands it to that server's
//! channel and walks the server list on retryable failures until the
//! operation lands or the retry budget runs out.
mod failed_servers;
mod failover;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use self::failed_servers::FailedServers;
use self::failover::AgeTracker;
use crate::config::Config;
use crate::core::balancer::BalancingStrategy;
use crate::core::{Cluster, ServerAddress};
use crate::error::{HotRodError, HotRodResult};
use crate::event::{ClientEvent, ClientListenerNotifier, CounterEvent};
use crate::metrics::{Counter, MetricsRegistry, RETRIES};
use crate::operations::{
    AddClientListenerOperation, AttemptFailure, AttemptResult, ErasedOperation, Operation, PendingOperation,
    QueuedOperation, RemoveClientListenerOperation,
};
use crate::protocol::{TopologyUpdate, DEFAULT_CACHE_NAME};
use crate::topology::{CacheInfo, ClientTopology, TopologyChange, TopologyInfo};
use crate::transport::handler::ChannelHandler;
use crate::transport::{ActivationStep, PingActivation, PoolSettings, TransportEvents, TransportSettings};

/// Everything the dispatcher needs from configuration
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub max_retries: u32,
    /// Longest wait for one attempt's response
    pub socket_timeout: Duration,
    /// How long a server that failed to connect is avoided
    pub server_failure_timeout: Duration,
    pub balancing: BalancingStrategy,
    pub transport: TransportSettings,
    pub pool: PoolSettings,
    /// Run in order on every new connection
    pub activation: Vec<Arc<dyn ActivationStep>>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let socket_timeout = Duration::from_secs(60);
        Self {
            max_retries: 3,
            socket_timeout,
            server_failure_timeout: Duration::from_secs(10),
            balancing: BalancingStrategy::RoundRobin,
            transport: TransportSettings::default(),
            pool: PoolSettings::default(),
            activation: vec![Arc::new(PingActivation::new(socket_timeout))],
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> HotRodResult<Self> {
        let socket_timeout = Duration::from_millis(config.client.socket_timeout_ms);
        Ok(Self {
            max_retries: config.client.max_retries,
            socket_timeout,
            server_failure_timeout: Duration::from_millis(config.client.server_failure_timeout_ms),
            balancing: config.client.balancing_strategy,
            transport: TransportSettings::from_config(config)?,
            pool: PoolSettings::from_config(config),
            activation: vec![Arc::new(PingActivation::new(socket_timeout))],
        })
    }
}

/// Topology and cluster-switch state, guarded together
struct DispatcherState {
    topology: TopologyInfo,
    /// Token of the automatic switch in progress
    cluster_switch: Option<u64>,
    next_switch_token: u64,
}

pub struct OperationDispatcher {
    state: RwLock<DispatcherState>,
    /// Main cluster first, then alternates in declaration order
    clusters: Vec<Arc<Cluster>>,
    handler: ChannelHandler,
    failed_servers: FailedServers,
    ages: AgeTracker,
    notifier: Arc<ClientListenerNotifier>,
    max_retries: u32,
    socket_timeout: Duration,
    retries: AtomicU64,
    retries_metric: Arc<Counter>,
    next_operation_id: AtomicU64,
    stopped: AtomicBool,
    me: Weak<OperationDispatcher>,
}

impl OperationDispatcher {
    pub fn new(
        main: Cluster,
        alternates: Vec<Cluster>,
        settings: DispatcherSettings,
        metrics: Arc<dyn MetricsRegistry>,
    ) -> Arc<Self> {
        let main = Arc::new(main);
        let mut clusters = vec![Arc::clone(&main)];
        clusters.extend(alternates.into_iter().map(Arc::new));

        Arc::new_cyclic(|me: &Weak<OperationDispatcher>| {
            let events: Weak<dyn TransportEvents> = me.clone();
            Self {
                state: RwLock::new(DispatcherState {
                    topology: TopologyInfo::new(main, settings.balancing.factory()),
                    cluster_switch: None,
                    next_switch_token: 0,
                }),
                clusters,
                handler: ChannelHandler::new(
                    settings.transport,
                    settings.pool,
                    settings.activation,
                    Arc::clone(&metrics),
                    events,
                ),
                failed_servers: FailedServers::new(settings.server_failure_timeout),
                ages: AgeTracker::new(),
                notifier: Arc::new(ClientListenerNotifier::new()),
                max_retries: settings.max_retries,
                socket_timeout: settings.socket_timeout,
                retries: AtomicU64::new(0),
                retries_metric: metrics.counter(RETRIES, &[]),
                next_operation_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
                me: me.clone(),
            }
        })
    }

    /// Open a first connection to every initial server. Failures are logged
    /// and left to the retry path.
    pub async fn start(&self) {
        let servers = {
            let mut state = self.state.write();
            state.topology.get_or_create_cache_info(DEFAULT_CACHE_NAME);
            state.topology.cluster().initial_servers().to_vec()
        };
        info!(servers = ?servers, "Starting operation dispatcher");

        let connects = servers.iter().map(|address| {
            let channel = self.handler.get_or_create_channel(address);
            async move { (address, channel.connect().await) }
        });
        for (address, result) in join_all(connects).await {
            match result {
                Ok(()) => debug!(address = %address, "Connected to initial server"),
                Err(e) => warn!(address = %address, error = %e, "Unable to connect to initial server"),
            }
        }
    }

    /// Stop dispatching; queued and in-flight operations fail with
    /// [`HotRodError::Interrupted`]
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let queued = self.handler.close_all();
        debug!(queued = queued.len(), "Stopping operation dispatcher");
        for operation in queued {
            operation.fail(HotRodError::Interrupted, None);
        }
        info!("Operation dispatcher stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn next_operation_id(&self) -> u64 {
        self.next_operation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route `operation`, retrying on other servers until it succeeds or
    /// the retry budget is spent
    pub async fn execute<O: Operation>(&self, operation: O) -> HotRodResult<O::Output> {
        let id = self.next_operation_id();
        let pending = PendingOperation::new(id, operation);
        let _ticket = self.ages.track(id);
        self.run(&pending, None).await.map(|(output, _)| output)
    }

    /// Single attempt against a fixed server, no retries
    pub(crate) async fn execute_once<O: Operation>(&self, operation: O, address: &ServerAddress) -> HotRodResult<O::Output> {
        let id = self.next_operation_id();
        let pending = PendingOperation::new(id, operation);
        let _ticket = self.ages.track(id);
        self.attempt(&pending, address).await.map_err(|failure| failure.error)
    }

    async fn run<O: Operation>(
        &self,
        pending: &Arc<PendingOperation<O>>,
        listener_id: Option<&[u8]>,
    ) -> HotRodResult<(O::Output, ServerAddress)> {
        loop {
            if self.is_stopped() {
                return Err(HotRodError::Interrupted);
            }
            let address = self.select_server(pending)?;
            if let Some(listener_id) = listener_id {
                // Events only flow from the connection the registration went to
                self.notifier.bind_address(listener_id, &address);
            }

            let failure = match self.attempt(pending, &address).await {
                Ok(output) => return Ok((output, address)),
                Err(failure) => failure,
            };
            if failure.resubmit {
                trace!(
                    operation = pending.operation().name(),
                    address = %address,
                    reason = %failure.error,
                    "Resubmitting operation"
                );
                tokio::task::yield_now().await;
                continue;
            }
            self.check_retry(pending, failure)?;
        }
    }

    async fn attempt<O: Operation>(
        &self,
        pending: &Arc<PendingOperation<O>>,
        address: &ServerAddress,
    ) -> AttemptResult<O::Output> {
        let (attempt, rx) = pending.begin_attempt();
        let erased: Arc<dyn ErasedOperation> = pending.clone();
        self.handler.submit(address, QueuedOperation::new(erased, attempt));

        let error = match timeout(self.socket_timeout, rx).await {
            Ok(Ok(result)) => return result,
            Ok(Err(_)) => HotRodError::transport(address, "Operation dropped before completion"),
            Err(_) => {
                pending.abandon_attempt(attempt);
                HotRodError::transport(address, format!("No response within {:?}", self.socket_timeout))
            }
        };
        Err(AttemptFailure {
            error,
            address: Some(address.clone()),
            resubmit: false,
        })
    }

    /// Ok to try again, or the error to hand back to the caller
    fn check_retry<O: Operation>(&self, pending: &PendingOperation<O>, failure: AttemptFailure) -> HotRodResult<()> {
        let AttemptFailure { error, address, .. } = failure;
        let operation = pending.operation();
        if !operation.supports_retry() || !error.is_retryable() {
            trace!(operation = operation.name(), error = %error, "Failure is not retryable");
            return Err(error);
        }
        if self.is_stopped() {
            debug!(operation = operation.name(), "Not retrying, dispatcher is stopping");
            return Err(HotRodError::Interrupted);
        }

        let retries = pending.record_retry(address.as_ref());
        if retries > self.max_retries {
            warn!(
                operation = operation.name(),
                retries = retries - 1,
                error = %error,
                "Exhausted retries"
            );
            return Err(error);
        }

        self.retries.fetch_add(1, Ordering::Relaxed);
        self.retries_metric.inc();
        debug!(
            operation = operation.name(),
            retry = retries,
            max_retries = self.max_retries,
            error = %error,
            "Retrying operation"
        );
        Ok(())
    }

    fn cache_info(&self, cache_name: &str) -> Arc<CacheInfo> {
        let existing = self.state.read().topology.cache_info(cache_name);
        match existing {
            Some(info) => info,
            None => self.state.write().topology.get_or_create_cache_info(cache_name),
        }
    }

    fn select_server<O: Operation>(&self, pending: &PendingOperation<O>) -> HotRodResult<ServerAddress> {
        let operation = pending.operation();
        let info = self.cache_info(operation.cache_name());
        let failed = pending.failed_servers();

        let owner = operation
            .routing_key()
            .and_then(|key| info.primary_server_for(key))
            .filter(|owner| !failed.contains(owner));
        let address = match owner {
            Some(owner) => owner,
            None => info.next_server(&failed).ok_or_else(|| HotRodError::NoServerAvailable {
                cache_name: operation.cache_name().to_string(),
            })?,
        };

        if self.failed_servers.contains(&address) {
            let connection_failed = self.failed_servers.snapshot();
            if let Some(alternative) = info.next_server(&connection_failed) {
                trace!(
                    failed = %address,
                    address = %alternative,
                    "Server failed to connect recently, picking another"
                );
                return Ok(alternative);
            }
        }
        Ok(address)
    }

    /// Register a client listener, pinning it to the server that accepts
    /// the registration. Events arrive on `sender`.
    pub async fn add_client_listener(
        &self,
        operation: AddClientListenerOperation,
        sender: mpsc::UnboundedSender<ClientEvent>,
    ) -> HotRodResult<ServerAddress> {
        let listener_id = operation.listener_id().clone();
        self.notifier.add_listener(listener_id.clone(), operation.cache_name(), sender);

        let id = self.next_operation_id();
        let pending = PendingOperation::new(id, operation);
        let _ticket = self.ages.track(id);
        match self.run(&pending, Some(&listener_id[..])).await {
            Ok(((), address)) => {
                self.notifier.start_listener(&listener_id);
                info!(
                    listener_id = %hex::encode(&listener_id),
                    address = %address,
                    "Client listener registered"
                );
                Ok(address)
            }
            Err(e) => {
                self.notifier.remove_listener(&listener_id);
                Err(e)
            }
        }
    }

    /// Remove a listener on the server it is pinned to; false if unknown
    pub async fn remove_client_listener(&self, cache_name: &str, listener_id: &[u8]) -> HotRodResult<bool> {
        let address = match self.notifier.listener_address(listener_id) {
            Some(address) => address,
            None => {
                debug!(listener_id = %hex::encode(listener_id), "Listener is not registered");
                return Ok(false);
            }
        };
        let operation = RemoveClientListenerOperation::new(cache_name, Bytes::copy_from_slice(listener_id));
        let removed = self.execute_once(operation, &address).await?;
        self.notifier.remove_listener(listener_id);
        Ok(removed)
    }

    pub fn notifier(&self) -> &Arc<ClientListenerNotifier> {
        &self.notifier
    }

    fn update_topology(&self, cache_name: &str, update: &TopologyUpdate) {
        let change = self.state.write().topology.update_topology(cache_name, update);
        let TopologyChange::Updated { added, removed } = change else {
            return;
        };

        for address in &added {
            debug!(address = %address, "New server added to topology");
            self.handler.start_channel_if_needed(address);
        }
        for address in &removed {
            debug!(address = %address, "Server removed from topology");
            self.failed_servers.remove(address);
            for operation in self.handler.remove_channel(address, true) {
                operation.resubmit(HotRodError::transport(address, "Server left the cluster"));
            }
        }
    }

    fn handle_connection_failure(&self, address: &ServerAddress) {
        self.failed_servers.add(address);

        let initial_servers = self.state.read().topology.cluster().initial_servers().to_vec();
        if self.clusters.len() > 1 && self.failed_servers.contains_all(&initial_servers) {
            debug!(address = %address, "All initial servers failed, trying another cluster");
            if let Some(me) = self.me.upgrade() {
                me.try_switch_cluster();
            }
        } else {
            self.reset_caches_with_failed_servers();
        }
    }

    /// Route caches whose every server failed back to the initial servers
    fn reset_caches_with_failed_servers(&self) {
        let failed = self.failed_servers.snapshot();
        if failed.is_empty() {
            return;
        }

        let mut state = self.state.write();
        let initial: HashSet<ServerAddress> = state.topology.cluster().initial_servers().iter().cloned().collect();
        let stale: Vec<String> = state
            .topology
            .caches()
            .filter(|info| {
                let servers = info.servers();
                !servers.is_empty()
                    && servers.iter().all(|server| failed.contains(server))
                    && servers.iter().cloned().collect::<HashSet<_>>() != initial
            })
            .map(|info| info.cache_name().to_string())
            .collect();

        for cache_name in stale {
            info!(cache = %cache_name, "All servers of cache failed, resetting to initial servers");
            state.topology.reset_cache_to_initial_servers(&cache_name);
        }
    }

    /// Total retries across all operations
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Servers currently routed to, or the initial servers before any cache exists
    pub fn servers(&self) -> Vec<ServerAddress> {
        let state = self.state.read();
        let mut servers: Vec<ServerAddress> = state.topology.all_servers().into_iter().collect();
        if servers.is_empty() {
            servers = state.topology.cluster().initial_servers().to_vec();
        }
        servers.sort();
        servers
    }

    pub fn connection_failed_servers(&self) -> HashSet<ServerAddress> {
        self.failed_servers.snapshot()
    }

    pub fn current_cluster_name(&self) -> String {
        self.state.read().topology.cluster().name().to_string()
    }

    pub fn topology_id(&self, cache_name: &str) -> Option<i32> {
        self.state.read().topology.cache_info(cache_name).map(|info| info.topology_id())
    }

    /// Segment owner for `key`, when the cache has a consistent hash
    pub fn address_for_key(&self, cache_name: &str, key: &[u8]) -> Option<ServerAddress> {
        self.state
            .read()
            .topology
            .cache_info(cache_name)
            .and_then(|info| info.primary_server_for(key))
    }

    /// In-flight operations issued before the last cluster switch
    pub fn prior_age_operations(&self) -> usize {
        self.ages.prior_age_operations()
    }
}

impl TransportEvents for OperationDispatcher {
    fn client_topology(&self, cache_name: &str) -> ClientTopology {
        self.state.read().topology.client_topology(cache_name)
    }

    fn receive_topology(&self, address: &ServerAddress, cache_name: &str, operation_id: u64, update: &TopologyUpdate) {
        if self.ages.is_prior_age(operation_id) {
            debug!(
                address = %address,
                cache = %cache_name,
                topology_id = update.topology_id,
                "Ignoring topology from an operation issued before the cluster switch"
            );
            return;
        }
        self.update_topology(cache_name, update);
    }

    fn cache_event(&self, address: &ServerAddress, listener_id: &[u8], event: ClientEvent) {
        self.notifier.dispatch_event(address, listener_id, event);
    }

    fn counter_event(&self, event: CounterEvent) {
        self.notifier.dispatch_counter_event(event);
    }

    fn listeners_lost(&self, address: &ServerAddress) {
        let failed_over = self.notifier.failover_listeners(address);
        if failed_over > 0 {
            info!(address = %address, listeners = failed_over, "Client listeners lost their connection");
        }
    }

    fn connection_established(&self, address: &ServerAddress) {
        if self.failed_servers.remove(address) {
            debug!(address = %address, "Server reachable again");
        }
    }

    fn connection_failed(&self, address: &ServerAddress, error: &HotRodError) {
        debug!(address = %address, error = %error, "Connection attempt failed");
        self.handle_connection_failure(address);
    }

    fn connection_closed(&self, address: &ServerAddress, cause: &HotRodError) {
        debug!(address = %address, cause = %cause, "Lost all connections to server");
    }
}
