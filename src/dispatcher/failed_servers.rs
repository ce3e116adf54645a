//! Servers that recently failed to connect

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::core::ServerAddress;

/// Time-bounded set of servers with no established connection.
///
/// Entries expire after `expiry`, so a node that recovers is tried again
/// without waiting for a topology push. A zero expiry keeps entries until
/// they are removed explicitly.
#[derive(Debug)]
pub(crate) struct FailedServers {
    expiry: Duration,
    entries: Mutex<HashMap<ServerAddress, Instant>>,
}

impl FailedServers {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, address: &ServerAddress) {
        self.entries.lock().insert(address.clone(), Instant::now());
    }

    pub fn remove(&self, address: &ServerAddress) -> bool {
        self.entries.lock().remove(address).is_some()
    }

    fn purge(&self, entries: &mut HashMap<ServerAddress, Instant>) {
        if self.expiry.is_zero() {
            return;
        }
        let expiry = self.expiry;
        entries.retain(|address, failed_at| {
            let keep = failed_at.elapsed() < expiry;
            if !keep {
                trace!(address = %address, "Failed server entry expired");
            }
            keep
        });
    }

    pub fn contains(&self, address: &ServerAddress) -> bool {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        entries.contains_key(address)
    }

    /// True when every address in `servers` has failed; false for an empty list
    pub fn contains_all(&self, servers: &[ServerAddress]) -> bool {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        !servers.is_empty() && servers.iter().all(|server| entries.contains_key(server))
    }

    pub fn snapshot(&self) -> HashSet<ServerAddress> {
        let mut entries = self.entries.lock();
        self.purge(&mut entries);
        entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(port: u16) -> ServerAddress {
        ServerAddress::new("127.0.0.1", port)
    }

    #[test]
    fn test_contains_all() {
        let failed = FailedServers::new(Duration::from_secs(60));
        failed.add(&address(1));
        assert!(failed.contains_all(&[address(1)]));
        assert!(!failed.contains_all(&[address(1), address(2)]));
        assert!(!failed.contains_all(&[]));

        failed.add(&address(2));
        assert!(failed.contains_all(&[address(1), address(2)]));
        assert!(failed.remove(&address(2)));
        assert!(!failed.remove(&address(2)));
        assert_eq!(failed.snapshot().len(), 1);
    }

    #[test]
    fn test_entries_expire() {
        let failed = FailedServers::new(Duration::from_millis(20));
        failed.add(&address(1));
        assert!(failed.contains(&address(1)));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!failed.contains(&address(1)));
        assert!(failed.snapshot().is_empty());
    }

    #[test]
    fn test_zero_expiry_keeps_entries() {
        let failed = FailedServers::new(Duration::ZERO);
        failed.add(&address(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(failed.contains(&address(1)));
    }
}
