//! Immutable per-cache routing snapshot

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::consistent_hash::SegmentConsistentHash;
use super::ClientTopology;
use crate::core::balancer::FailoverRequestBalancingStrategy;
use crate::core::{ClientIntelligence, ServerAddress};
use crate::protocol::DEFAULT_CACHE_TOPOLOGY;

/// Routing state of one cache.
///
/// Never mutated once published: every topology change builds a new value
/// and swaps it in, so a reader sees one consistent server list, hash and
/// topology id. Only the balancer is shared between versions.
pub struct CacheInfo {
    cache_name: String,
    servers: Vec<ServerAddress>,
    topology_id: i32,
    topology_age: u32,
    intelligence: ClientIntelligence,
    consistent_hash: Option<Arc<SegmentConsistentHash>>,
    balancer: Arc<Mutex<Box<dyn FailoverRequestBalancingStrategy>>>,
}

impl CacheInfo {
    pub fn new(
        cache_name: &str,
        mut balancer: Box<dyn FailoverRequestBalancingStrategy>,
        topology_age: u32,
        servers: Vec<ServerAddress>,
        intelligence: ClientIntelligence,
    ) -> Self {
        balancer.set_servers(&servers);
        Self {
            cache_name: cache_name.to_string(),
            servers,
            topology_id: DEFAULT_CACHE_TOPOLOGY,
            topology_age,
            intelligence,
            consistent_hash: None,
            balancer: Arc::new(Mutex::new(balancer)),
        }
    }

    /// New server list without segment information
    pub fn with_new_servers(&self, topology_id: i32, servers: Vec<ServerAddress>) -> Self {
        self.with_new_hash(topology_id, servers, None)
    }

    pub fn with_new_hash(
        &self,
        topology_id: i32,
        servers: Vec<ServerAddress>,
        consistent_hash: Option<SegmentConsistentHash>,
    ) -> Self {
        self.balancer.lock().set_servers(&servers);
        Self {
            cache_name: self.cache_name.clone(),
            servers,
            topology_id,
            topology_age: self.topology_age,
            intelligence: self.intelligence,
            consistent_hash: consistent_hash.map(Arc::new),
            balancer: Arc::clone(&self.balancer),
        }
    }

    /// Reset to another cluster's initial servers after a cluster switch
    pub fn with_cluster(
        &self,
        topology_age: u32,
        topology_id: i32,
        servers: Vec<ServerAddress>,
        intelligence: ClientIntelligence,
    ) -> Self {
        self.balancer.lock().set_servers(&servers);
        Self {
            cache_name: self.cache_name.clone(),
            servers,
            topology_id,
            topology_age,
            intelligence,
            consistent_hash: None,
            balancer: Arc::clone(&self.balancer),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    pub fn topology_id(&self) -> i32 {
        self.topology_id
    }

    pub fn topology_age(&self) -> u32 {
        self.topology_age
    }

    pub fn intelligence(&self) -> ClientIntelligence {
        self.intelligence
    }

    pub fn consistent_hash(&self) -> Option<&SegmentConsistentHash> {
        self.consistent_hash.as_deref()
    }

    pub fn num_segments(&self) -> usize {
        self.consistent_hash
            .as_ref()
            .map(|hash| hash.num_segments())
            .unwrap_or(0)
    }

    /// Values the next request header for this cache carries
    pub fn client_topology(&self) -> ClientTopology {
        ClientTopology {
            topology_id: self.topology_id,
            intelligence: self.intelligence,
        }
    }

    /// Primary owner of `key`, if segment ownership is known
    pub fn primary_server_for(&self, key: &[u8]) -> Option<ServerAddress> {
        self.consistent_hash
            .as_ref()
            .and_then(|hash| hash.server(key))
            .cloned()
    }

    pub fn primary_segments_by_server(&self) -> HashMap<ServerAddress, BTreeSet<usize>> {
        self.consistent_hash
            .as_ref()
            .map(|hash| hash.primary_segments_by_server())
            .unwrap_or_default()
    }

    /// Ask the balancer, serialized per cache
    pub fn next_server(&self, failed_servers: &HashSet<ServerAddress>) -> Option<ServerAddress> {
        self.balancer.lock().next_server(failed_servers)
    }
}

impl fmt::Debug for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInfo")
            .field("cache_name", &self.cache_name)
            .field("servers", &self.servers)
            .field("topology_id", &self.topology_id)
            .field("topology_age", &self.topology_age)
            .field("num_segments", &self.num_segments())
            .finish()
    }
}
