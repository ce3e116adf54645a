//! Failover-aware request balancing strategies
//!
//! A strategy instance belongs to one cache and is not thread safe; the
//! topology layer keeps it behind a mutex so callers are serialized per cache.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::core::ServerAddress;

/// Picks the next server for an operation that has no (usable) hash owner
pub trait FailoverRequestBalancingStrategy: Send + fmt::Debug {
    /// Replace the server list after a topology change
    fn set_servers(&mut self, servers: &[ServerAddress]);

    /// Next server, avoiding `failed_servers` where possible
    fn next_server(&mut self, failed_servers: &HashSet<ServerAddress>) -> Option<ServerAddress>;
}

/// Creates a fresh strategy for every cache
pub type BalancerFactory = Arc<dyn Fn() -> Box<dyn FailoverRequestBalancingStrategy> + Send + Sync>;

/// Built-in strategies selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalancingStrategy {
    RoundRobin,
    Random,
}

impl Default for BalancingStrategy {
    fn default() -> Self {
        BalancingStrategy::RoundRobin
    }
}

impl BalancingStrategy {
    pub fn create(self) -> Box<dyn FailoverRequestBalancingStrategy> {
        match self {
            BalancingStrategy::RoundRobin => Box::new(RoundRobinBalancingStrategy::new()),
            BalancingStrategy::Random => Box::new(RandomBalancingStrategy::new()),
        }
    }

    pub fn factory(self) -> BalancerFactory {
        Arc::new(move || self.create())
    }
}

/// Round-robin over the server list, starting at a random position
#[derive(Debug, Default)]
pub struct RoundRobinBalancingStrategy {
    servers: Vec<ServerAddress>,
    index: usize,
}

impl RoundRobinBalancingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current server list
    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }
}

impl FailoverRequestBalancingStrategy for RoundRobinBalancingStrategy {
    fn set_servers(&mut self, servers: &[ServerAddress]) {
        self.servers = servers.to_vec();
        self.index = if self.servers.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..self.servers.len())
        };
    }

    fn next_server(&mut self, failed_servers: &HashSet<ServerAddress>) -> Option<ServerAddress> {
        if self.servers.is_empty() {
            return None;
        }

        // Once every failed server has been skipped, hand out whatever comes next
        let mut skipped = 0;
        loop {
            let server = &self.servers[self.index];
            self.index = (self.index + 1) % self.servers.len();
            if !failed_servers.contains(server) || skipped >= failed_servers.len() {
                return Some(server.clone());
            }
            skipped += 1;
        }
    }
}

/// Uniform random choice among servers that have not failed
#[derive(Debug, Default)]
pub struct RandomBalancingStrategy {
    servers: Vec<ServerAddress>,
}

impl RandomBalancingStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FailoverRequestBalancingStrategy for RandomBalancingStrategy {
    fn set_servers(&mut self, servers: &[ServerAddress]) {
        self.servers = servers.to_vec();
    }

    fn next_server(&mut self, failed_servers: &HashSet<ServerAddress>) -> Option<ServerAddress> {
        let candidates: Vec<&ServerAddress> = self
            .servers
            .iter()
            .filter(|server| !failed_servers.contains(*server))
            .collect();

        let mut rng = rand::thread_rng();
        if candidates.is_empty() {
            if self.servers.is_empty() {
                return None;
            }
            return Some(self.servers[rng.gen_range(0..self.servers.len())].clone());
        }
        Some(candidates[rng.gen_range(0..candidates.len())].clone())
    }
}
