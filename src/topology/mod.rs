//! Cluster topology: per-cache server lists, segment ownership and cluster age
pub mod cache_info;
pub mod consistent_hash;

pub use cache_info::CacheInfo;
pub use consistent_hash::{murmur3_hash, SegmentConsistentHash};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::core::balancer::BalancerFactory;
use crate::core::{ClientIntelligence, Cluster, ServerAddress};
use crate::protocol::{TopologyUpdate, DEFAULT_CACHE_TOPOLOGY, SWITCH_CLUSTER_TOPOLOGY};

/// Topology fields written in a request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTopology {
    pub topology_id: i32,
    pub intelligence: ClientIntelligence,
}

/// Outcome of applying a server topology update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    Ignored,
    Updated {
        /// Servers no cache used before
        added: Vec<ServerAddress>,
        /// Servers no cache uses any more
        removed: Vec<ServerAddress>,
    },
}

/// Active cluster plus one [`CacheInfo`] per cache name.
///
/// Not synchronized itself; the dispatcher keeps it behind a reader-writer
/// lock and only clones `Arc<CacheInfo>` snapshots out of it.
pub struct TopologyInfo {
    cluster: Arc<Cluster>,
    caches: HashMap<String, Arc<CacheInfo>>,
    topology_age: u32,
    balancer_factory: BalancerFactory,
}

impl TopologyInfo {
    pub fn new(cluster: Arc<Cluster>, balancer_factory: BalancerFactory) -> Self {
        Self {
            cluster,
            caches: HashMap::new(),
            topology_age: 0,
            balancer_factory,
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn topology_age(&self) -> u32 {
        self.topology_age
    }

    pub fn cache_info(&self, cache_name: &str) -> Option<Arc<CacheInfo>> {
        self.caches.get(cache_name).cloned()
    }

    pub fn get_or_create_cache_info(&mut self, cache_name: &str) -> Arc<CacheInfo> {
        if let Some(info) = self.caches.get(cache_name) {
            return Arc::clone(info);
        }
        let info = Arc::new(CacheInfo::new(
            cache_name,
            (self.balancer_factory)(),
            self.topology_age,
            self.cluster.initial_servers().to_vec(),
            self.cluster.intelligence(),
        ));
        self.caches.insert(cache_name.to_string(), Arc::clone(&info));
        info
    }

    /// Header values for a cache, without creating it
    pub fn client_topology(&self, cache_name: &str) -> ClientTopology {
        match self.caches.get(cache_name) {
            Some(info) => info.client_topology(),
            None => ClientTopology {
                topology_id: if self.topology_age == 0 {
                    DEFAULT_CACHE_TOPOLOGY
                } else {
                    SWITCH_CLUSTER_TOPOLOGY
                },
                intelligence: self.cluster.intelligence(),
            },
        }
    }

    pub fn caches(&self) -> impl Iterator<Item = &Arc<CacheInfo>> {
        self.caches.values()
    }

    /// Every server some cache currently routes to
    pub fn all_servers(&self) -> HashSet<ServerAddress> {
        self.caches
            .values()
            .flat_map(|info| info.servers().iter().cloned())
            .collect()
    }

    /// Apply a topology pushed by the server.
    ///
    /// Within one cluster age topology ids only move forward; negative ids
    /// mark a reset (new cache or cluster switch) and accept any update.
    pub fn update_topology(&mut self, cache_name: &str, update: &TopologyUpdate) -> TopologyChange {
        let current = self.get_or_create_cache_info(cache_name);
        let current_id = current.topology_id();
        if update.topology_id == current_id || (current_id >= 0 && update.topology_id < current_id) {
            trace!(
                cache = %cache_name,
                current = current_id,
                received = update.topology_id,
                "Ignoring stale topology"
            );
            return TopologyChange::Ignored;
        }

        let before = self.all_servers();
        let next = if update.hash_function_version > 0 {
            let hash = SegmentConsistentHash::new(update.segment_owners.clone(), update.hash_function_version);
            current.with_new_hash(update.topology_id, update.servers.clone(), hash)
        } else {
            if update.hash_function_version == 0 {
                debug!(cache = %cache_name, "Not using a consistent hash function (hash function version == 0)");
            }
            current.with_new_servers(update.topology_id, update.servers.clone())
        };

        info!(
            cache = %cache_name,
            topology_id = update.topology_id,
            servers = ?update.servers,
            "New topology received"
        );
        self.caches.insert(cache_name.to_string(), Arc::new(next));

        let after = self.all_servers();
        TopologyChange::Updated {
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }

    /// Route a cache through the cluster's initial servers again
    pub fn reset_cache_to_initial_servers(&mut self, cache_name: &str) {
        if let Some(info) = self.caches.get(cache_name) {
            let reset = info.with_new_servers(DEFAULT_CACHE_TOPOLOGY, self.cluster.initial_servers().to_vec());
            debug!(cache = %cache_name, servers = ?reset.servers(), "Resetting cache to initial servers");
            self.caches.insert(cache_name.to_string(), Arc::new(reset));
        }
    }

    /// Install another cluster and start a new topology age
    pub fn switch_cluster(&mut self, cluster: Arc<Cluster>) {
        self.topology_age += 1;
        self.cluster = cluster;
        let servers = self.cluster.initial_servers().to_vec();
        let intelligence = self.cluster.intelligence();
        for info in self.caches.values_mut() {
            *info = Arc::new(info.with_cluster(
                self.topology_age,
                SWITCH_CLUSTER_TOPOLOGY,
                servers.clone(),
                intelligence,
            ));
        }
        info!(
            cluster = %self.cluster.name(),
            age = self.topology_age,
            "Switched to cluster"
        );
    }
}
