//! Cluster failover and prior-age operation tracking
//!
//! When every initial server of the active cluster has failed to connect,
//! the dispatcher pings the other configured clusters in declaration order
//! and switches to the first one with a live server. Switching starts a new
//! topology age; operations issued in an earlier age keep their own retry
//! bookkeeping and finish on whatever connection they already use, and
//! topology pushes they carry are ignored.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::OperationDispatcher;
use crate::core::{Cluster, ServerAddress, DEFAULT_CLUSTER_NAME};
use crate::operations::PingOperation;
use crate::protocol::DEFAULT_CACHE_NAME;

/// Topology age each in-flight operation was issued in
#[derive(Debug, Default)]
pub(crate) struct AgeTracker {
    operations: DashMap<u64, u32>,
    current: AtomicU32,
}

/// Keeps an operation tracked until dropped
pub(crate) struct AgeTicket<'a> {
    tracker: &'a AgeTracker,
    operation_id: u64,
}

impl Drop for AgeTicket<'_> {
    fn drop(&mut self) {
        self.tracker.complete(self.operation_id);
    }
}

impl AgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_age(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn track(&self, operation_id: u64) -> AgeTicket<'_> {
        self.operations.insert(operation_id, self.current_age());
        AgeTicket {
            tracker: self,
            operation_id,
        }
    }

    fn complete(&self, operation_id: u64) {
        if let Some((_, age)) = self.operations.remove(&operation_id) {
            let current = self.current_age();
            if age < current && self.prior_age_operations() == 0 {
                debug!(age = current, "All prior age operations completed");
            }
        }
    }

    /// Whether `operation_id` was issued before the last cluster switch
    pub fn is_prior_age(&self, operation_id: u64) -> bool {
        self.operations
            .get(&operation_id)
            .map(|age| *age < self.current_age())
            .unwrap_or(false)
    }

    pub fn prior_age_operations(&self) -> usize {
        let current = self.current_age();
        self.operations.iter().filter(|entry| *entry.value() < current).count()
    }

    /// Start a new age; everything tracked so far becomes prior age
    pub fn advance(&self, age: u32) -> usize {
        self.current.store(age, Ordering::Release);
        let prior = self.prior_age_operations();
        debug!(age, prior_age_operations = prior, "Topology age advanced");
        prior
    }
}

impl OperationDispatcher {
    /// Begin an automatic switch unless one is already running
    pub(super) fn try_switch_cluster(self: &Arc<Self>) {
        let (token, age, cluster) = {
            let mut state = self.state.write();
            if state.cluster_switch.is_some() {
                trace!("Cluster switch is already in progress");
                return;
            }
            state.next_switch_token += 1;
            let token = state.next_switch_token;
            state.cluster_switch = Some(token);
            (token, state.topology.topology_age(), Arc::clone(state.topology.cluster()))
        };

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run_cluster_switch(token, age, cluster).await;
            dispatcher.complete_cluster_switch(token);
        });
    }

    async fn run_cluster_switch(&self, token: u64, age: u32, failed: Arc<Cluster>) {
        if self.check_servers_alive(failed.initial_servers()).await {
            // The successful connect already cleared the failed entry
            trace!(cluster = %failed.name(), "Cluster is still alive, not switching");
            return;
        }

        trace!(cluster = %failed.name(), "Trying to switch cluster away");
        let candidates: Vec<Arc<Cluster>> = self
            .clusters
            .iter()
            .filter(|cluster| cluster.name() != failed.name())
            .cloned()
            .collect();

        for candidate in candidates {
            if !self.switch_still_wanted(token, age) {
                debug!("Cluster switch already completed elsewhere, bailing out");
                return;
            }
            if self.check_servers_alive(candidate.initial_servers()).await {
                self.automatic_switch_to_cluster(candidate, token, age);
                return;
            }
        }
        debug!(clusters = self.clusters.len(), "All cluster addresses viewed and none worked");
    }

    fn switch_still_wanted(&self, token: u64, age: u32) -> bool {
        let state = self.state.read();
        state.cluster_switch == Some(token) && state.topology.topology_age() == age
    }

    /// True as soon as one server answers a ping
    async fn check_servers_alive(&self, servers: &[ServerAddress]) -> bool {
        let mut pings: FuturesUnordered<_> = servers
            .iter()
            .map(|server| async move {
                let result = self
                    .execute_once(PingOperation::new(DEFAULT_CACHE_NAME), server)
                    .await;
                (server, result)
            })
            .collect();

        while let Some((server, result)) = pings.next().await {
            match result {
                Ok(_) => {
                    trace!(address = %server, "Ping succeeded");
                    return true;
                }
                Err(e) => trace!(address = %server, error = %e, "Error checking whether server is alive"),
            }
        }
        false
    }

    fn automatic_switch_to_cluster(&self, cluster: Arc<Cluster>, token: u64, age: u32) {
        let stale = {
            let mut state = self.state.write();
            if state.cluster_switch != Some(token) || state.topology.topology_age() != age {
                debug!("Cluster switch already completed elsewhere, bailing out");
                return;
            }
            debug!(
                cluster = %cluster.name(),
                servers = ?cluster.initial_servers(),
                "Switching to cluster"
            );
            self.install_cluster(&mut state.topology, Arc::clone(&cluster))
        };
        self.close_stale_channels(stale);

        if cluster.name() == DEFAULT_CLUSTER_NAME {
            info!("Switched back to main cluster");
        } else {
            info!(cluster = %cluster.name(), "Switched to cluster");
        }
    }

    /// Switch by name; cancels an automatic switch in progress
    pub fn switch_to_cluster(&self, name: &str) -> bool {
        if self.clusters.len() <= 1 {
            debug!("No alternative clusters configured, so can't switch cluster");
            return false;
        }
        let cluster = match self.clusters.iter().find(|cluster| cluster.name() == name) {
            Some(cluster) => Arc::clone(cluster),
            None => {
                debug!(cluster = %name, "Cluster does not exist in the configuration");
                return false;
            }
        };

        let stale = {
            let mut state = self.state.write();
            if state.cluster_switch.take().is_some() {
                debug!("Another cluster switch is already in progress, overriding it");
            }
            debug!(cluster = %name, servers = ?cluster.initial_servers(), "Switching to cluster");
            self.install_cluster(&mut state.topology, Arc::clone(&cluster))
        };
        self.close_stale_channels(stale);

        if name == DEFAULT_CLUSTER_NAME {
            info!("Manually switched back to main cluster");
        } else {
            info!(cluster = %name, "Manually switched to cluster");
        }
        true
    }

    pub fn switch_to_default_cluster(&self) -> bool {
        self.switch_to_cluster(DEFAULT_CLUSTER_NAME)
    }

    /// Swap the active cluster under the write lock; returns servers that
    /// belong only to the cluster being left
    fn install_cluster(&self, topology: &mut crate::topology::TopologyInfo, cluster: Arc<Cluster>) -> Vec<ServerAddress> {
        let mut previous: HashSet<ServerAddress> = topology.all_servers();
        previous.extend(topology.cluster().initial_servers().iter().cloned());
        for server in &previous {
            self.failed_servers.remove(server);
        }

        topology.switch_cluster(Arc::clone(&cluster));
        let prior = self.ages.advance(topology.topology_age());
        trace!(prior_age_operations = prior, "Marked in-flight operations as prior age");

        let next: HashSet<&ServerAddress> = cluster.initial_servers().iter().collect();
        previous.into_iter().filter(|server| !next.contains(server)).collect()
    }

    /// In-flight operations finish on the old connections; queued ones are
    /// dispatched again in the new age
    fn close_stale_channels(&self, servers: Vec<ServerAddress>) {
        for server in servers {
            let queued = self.handler.remove_channel(&server, true);
            for operation in queued {
                operation.resubmit(crate::error::HotRodError::transport(&server, "Cluster switched"));
            }
        }
    }

    fn complete_cluster_switch(&self, token: u64) {
        let mut state = self.state.write();
        if state.cluster_switch == Some(token) {
            state.cluster_switch = None;
        }
    }
}
