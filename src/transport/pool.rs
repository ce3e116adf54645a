//! Bounded pool of connections to one server address
//!
//! Idle connections are reused most-recently-released first. When the pool
//! is at capacity the configured [`ExhaustedAction`] applies; waiters are
//! served in arrival order. Counters obey `0 <= active <= created <= max_active`
//! (when bounded) and every closed connection is subtracted exactly once.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::connection::{Connector, ReleaseState, WireConnection};
use super::PoolSettings;
use crate::config::ExhaustedAction;
use crate::core::ServerAddress;
use crate::error::{HotRodError, HotRodResult};
use crate::metrics::{MetricId, MetricsRegistry, POOL_ACTIVE, POOL_CONNECTED, POOL_IDLE};

/// Idle connections inspected per acquire before giving up on reuse
const MAX_FULL_CHANNELS_SEEN: usize = 10;

/// Pool lifecycle notifications, delivered to the owning channel
#[derive(Debug)]
pub(crate) enum PoolEvent<'a> {
    Connected,
    ConnectFailed(&'a HotRodError),
    Closed {
        /// Set when the connection failed rather than being closed on purpose
        cause: Option<&'a HotRodError>,
        /// Connections still open to this address
        remaining: i32,
    },
}

pub(crate) trait PoolEventListener: Send + Sync {
    fn on_pool_event(&self, address: &ServerAddress, event: PoolEvent<'_>);
}

type Grant = oneshot::Sender<HotRodResult<Arc<WireConnection>>>;

struct Waiter {
    id: u64,
    grant: Grant,
    /// Set by whichever of grant and timeout wins
    claimed: Arc<AtomicBool>,
}

#[derive(Default)]
struct PoolQueues {
    idle: VecDeque<Arc<WireConnection>>,
    waiters: VecDeque<Waiter>,
}

enum Acquired {
    Ready(Arc<WireConnection>),
    Create,
    Wait(oneshot::Receiver<HotRodResult<Arc<WireConnection>>>, Arc<AtomicBool>, u64),
}

pub(crate) struct ConnectionPool {
    address: ServerAddress,
    settings: PoolSettings,
    connector: Arc<Connector>,
    queues: Mutex<PoolQueues>,
    connections: DashMap<u64, Arc<WireConnection>>,
    created: AtomicI32,
    active: AtomicI32,
    connected: AtomicI32,
    terminated: AtomicBool,
    next_waiter: AtomicU64,
    listener: Weak<dyn PoolEventListener>,
    metrics: Arc<dyn MetricsRegistry>,
    gauges: Vec<MetricId>,
}

impl ConnectionPool {
    pub fn new(
        address: ServerAddress,
        settings: PoolSettings,
        connector: Arc<Connector>,
        listener: Weak<dyn PoolEventListener>,
        metrics: Arc<dyn MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ConnectionPool>| {
            let tags = [("server", address.to_string())];
            let gauge = |name: &str, read: fn(&ConnectionPool) -> i32| {
                let pool = me.clone();
                metrics.gauge(
                    name,
                    &tags,
                    Box::new(move || pool.upgrade().map(|p| i64::from(read(&p))).unwrap_or(0)),
                )
            };
            let gauges = vec![
                gauge(POOL_ACTIVE, ConnectionPool::active),
                gauge(POOL_IDLE, ConnectionPool::idle),
                gauge(POOL_CONNECTED, ConnectionPool::connected),
            ];

            Self {
                address,
                settings,
                connector,
                queues: Mutex::new(PoolQueues::default()),
                connections: DashMap::new(),
                created: AtomicI32::new(0),
                active: AtomicI32::new(0),
                connected: AtomicI32::new(0),
                terminated: AtomicBool::new(false),
                next_waiter: AtomicU64::new(1),
                listener,
                metrics,
                gauges,
            }
        })
    }

    pub fn active(&self) -> i32 {
        self.active.load(Ordering::Acquire)
    }

    pub fn created(&self) -> i32 {
        self.created.load(Ordering::Acquire)
    }

    pub fn connected(&self) -> i32 {
        self.connected.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> i32 {
        self.queues.lock().idle.len() as i32
    }

    pub fn waiting(&self) -> usize {
        self.queues.lock().waiters.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Hand out a usable connection, creating or waiting as the policy allows
    pub async fn acquire(self: &Arc<Self>) -> HotRodResult<Arc<WireConnection>> {
        if self.is_terminated() {
            return Err(self.closed_error());
        }

        let acquired = {
            let mut queues = self.queues.lock();
            if let Some(connection) = self.poll_idle(&mut queues) {
                Acquired::Ready(connection)
            } else if self.try_reserve() {
                Acquired::Create
            } else {
                match self.settings.exhausted_action {
                    ExhaustedAction::Exception => {
                        return Err(HotRodError::PoolExhausted {
                            address: self.address.clone(),
                            message: format!("max_active={} reached", self.settings.max_active),
                        })
                    }
                    ExhaustedAction::CreateNew => {
                        self.created.fetch_add(1, Ordering::AcqRel);
                        self.active.fetch_add(1, Ordering::AcqRel);
                        Acquired::Create
                    }
                    ExhaustedAction::Wait => {
                        let (grant, rx) = oneshot::channel();
                        let claimed = Arc::new(AtomicBool::new(false));
                        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                        queues.waiters.push_back(Waiter {
                            id,
                            grant,
                            claimed: Arc::clone(&claimed),
                        });
                        trace!(address = %self.address, waiters = queues.waiters.len(), "Waiting for a connection");
                        Acquired::Wait(rx, claimed, id)
                    }
                }
            }
        };

        match acquired {
            Acquired::Ready(connection) => Ok(connection),
            Acquired::Create => self.create_connection().await,
            Acquired::Wait(rx, claimed, id) => self.wait_for_grant(rx, claimed, id).await,
        }
    }

    fn poll_idle(&self, queues: &mut PoolQueues) -> Option<Arc<WireConnection>> {
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(connection) = queues.idle.pop_front() {
            if !connection.is_active() {
                // Accounting happens when the close watcher runs
                trace!(address = %self.address, connection = connection.id(), "Dropping dead idle connection");
                continue;
            }
            if !connection.is_writable()
                || connection.registered_operations() >= self.settings.max_pending_requests
            {
                skipped.push(connection);
                if skipped.len() >= MAX_FULL_CHANNELS_SEEN {
                    break;
                }
                continue;
            }
            if connection.set_acquired() {
                self.active.fetch_add(1, Ordering::AcqRel);
                found = Some(connection);
                break;
            }
        }
        for connection in skipped.into_iter().rev() {
            queues.idle.push_front(connection);
        }
        found
    }

    /// Reserve a slot for a new connection below `max_active`
    fn try_reserve(&self) -> bool {
        let max = self.settings.max_active;
        let reserved = self
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                if max < 0 || created < max {
                    Some(created + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if reserved {
            self.active.fetch_add(1, Ordering::AcqRel);
        }
        reserved
    }

    async fn wait_for_grant(
        &self,
        mut rx: oneshot::Receiver<HotRodResult<Arc<WireConnection>>>,
        claimed: Arc<AtomicBool>,
        id: u64,
    ) -> HotRodResult<Arc<WireConnection>> {
        let result = match self.settings.max_wait {
            Some(max_wait) => match timeout(max_wait, &mut rx).await {
                Ok(result) => result,
                Err(_) => {
                    if !claimed.swap(true, Ordering::AcqRel) {
                        self.queues.lock().waiters.retain(|waiter| waiter.id != id);
                        debug!(address = %self.address, ?max_wait, "Timed out waiting for a connection");
                        return Err(HotRodError::timeout(format!(
                            "waiting {:?} for a connection to {}",
                            max_wait, self.address
                        )));
                    }
                    // A grant won the race and is on its way
                    rx.await
                }
            },
            None => rx.await,
        };
        result.unwrap_or_else(|_| Err(self.closed_error()))
    }

    /// Open a connection for an already reserved slot.
    ///
    /// Runs on its own task so the accounting completes even if the caller
    /// goes away; an orphaned connection goes back to the pool.
    async fn create_connection(self: &Arc<Self>) -> HotRodResult<Arc<WireConnection>> {
        let (tx, rx) = oneshot::channel();
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let result = pool.connect_new().await;
            if let Err(Ok(connection)) = tx.send(result) {
                pool.release(connection);
            }
        });
        rx.await
            .unwrap_or_else(|_| Err(HotRodError::internal("Connection attempt was abandoned")))
    }

    async fn connect_new(self: &Arc<Self>) -> HotRodResult<Arc<WireConnection>> {
        match self.connector.connect(&self.address).await {
            Ok(connection) => {
                self.connected.fetch_add(1, Ordering::AcqRel);
                self.connections.insert(connection.id(), Arc::clone(&connection));
                self.watch_close(&connection);
                debug!(
                    address = %self.address,
                    connection = connection.id(),
                    created = self.created(),
                    "New connection"
                );

                if self.is_terminated() {
                    connection.close();
                    return Err(self.closed_error());
                }
                self.notify(PoolEvent::Connected);
                Ok(connection)
            }
            Err(error) => {
                decrement(&self.active, &self.address, "active");
                decrement(&self.created, &self.address, "created");
                self.notify(PoolEvent::ConnectFailed(&error));
                if self.connected() == 0 {
                    self.reject_waiters(&error);
                }
                Err(error)
            }
        }
    }

    fn watch_close(self: &Arc<Self>, connection: &Arc<WireConnection>) {
        let pool = Arc::downgrade(self);
        let connection = Arc::clone(connection);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(pool) = pool.upgrade() {
                pool.release_closed(&connection);
            }
        });
    }

    /// Return a connection. Waiters get it first, otherwise it becomes idle.
    pub fn release(&self, connection: Arc<WireConnection>) {
        if connection.is_idle() {
            warn!(
                address = %self.address,
                connection = connection.id(),
                "Releasing a connection that is already idle"
            );
            return;
        }
        if connection.is_record_closed() {
            return;
        }
        if self.is_terminated() {
            tokio::spawn(async move { connection.close_gracefully().await });
            return;
        }

        let mut queues = self.queues.lock();
        if connection.is_writable() {
            while let Some(waiter) = queues.waiters.pop_front() {
                if waiter.claimed.swap(true, Ordering::AcqRel) {
                    continue;
                }
                if waiter.grant.send(Ok(Arc::clone(&connection))).is_ok() {
                    trace!(address = %self.address, connection = connection.id(), "Handed connection to waiter");
                    return;
                }
            }
        }

        match connection.mark_idle() {
            ReleaseState::Released => {
                decrement(&self.active, &self.address, "active");
                queues.idle.push_front(connection);
            }
            ReleaseState::AlreadyIdle => {
                warn!(address = %self.address, connection = connection.id(), "Connection released twice");
            }
            ReleaseState::Closed => {}
        }
    }

    /// Subtract a closed connection from the counters, once
    fn release_closed(self: &Arc<Self>, connection: &Arc<WireConnection>) {
        self.connections.remove(&connection.id());
        let was_idle = match connection.mark_closed() {
            Some(was_idle) => was_idle,
            None => {
                warn!(
                    address = %self.address,
                    connection = connection.id(),
                    "Connection close recorded twice"
                );
                return;
            }
        };

        self.queues.lock().idle.retain(|idle| idle.id() != connection.id());
        if !was_idle {
            decrement(&self.active, &self.address, "active");
        }
        decrement(&self.connected, &self.address, "connected");
        decrement(&self.created, &self.address, "created");

        let cause = connection.close_cause();
        let remaining = self.connected();
        trace!(
            address = %self.address,
            connection = connection.id(),
            created = self.created(),
            active = self.active(),
            remaining,
            "Connection removed from pool"
        );
        self.notify(PoolEvent::Closed {
            cause: cause.as_ref(),
            remaining,
        });

        // A slot opened up for whoever is queued
        if !self.is_terminated() && self.waiting() > 0 && self.try_reserve() {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                if let Ok(connection) = pool.connect_new().await {
                    pool.release(connection);
                }
            });
        }
    }

    fn reject_waiters(&self, error: &HotRodError) {
        let waiters: Vec<Waiter> = self.queues.lock().waiters.drain(..).collect();
        for waiter in waiters {
            if !waiter.claimed.swap(true, Ordering::AcqRel) {
                let _ = waiter.grant.send(Err(error.clone()));
            }
        }
    }

    fn notify(&self, event: PoolEvent<'_>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_pool_event(&self.address, event);
        }
    }

    fn closed_error(&self) -> HotRodError {
        HotRodError::transport(&self.address, "Connection pool is closed")
    }

    fn terminate(&self) -> Vec<Arc<WireConnection>> {
        self.terminated.store(true, Ordering::Release);
        self.reject_waiters(&self.closed_error());
        for id in &self.gauges {
            self.metrics.remove(id);
        }
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Close every connection now
    pub fn close(&self) {
        let connections = self.terminate();
        debug!(address = %self.address, connections = connections.len(), "Closing connection pool");
        for connection in connections {
            connection.close();
        }
    }

    /// Let in-flight responses arrive, then close
    pub fn close_gracefully(&self) {
        let connections = self.terminate();
        debug!(
            address = %self.address,
            connections = connections.len(),
            "Closing connection pool gracefully"
        );
        for connection in connections {
            tokio::spawn(async move { connection.close_gracefully().await });
        }
    }
}

fn decrement(counter: &AtomicI32, address: &ServerAddress, name: &'static str) {
    let result = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
        if value > 0 {
            Some(value - 1)
        } else {
            None
        }
    });
    if result.is_err() {
        warn!(address = %address, counter = name, "Connection pool counter would go negative");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{InMemoryMetricsRegistry, NoopMetricsRegistry};
    use crate::testing::{detached_events, unused_address, MockServer};
    use crate::transport::TransportSettings;
    use std::time::Duration;

    struct NoListener;

    impl PoolEventListener for NoListener {
        fn on_pool_event(&self, _address: &ServerAddress, _event: PoolEvent<'_>) {}
    }

    fn pool_with(address: ServerAddress, settings: PoolSettings, metrics: Arc<dyn MetricsRegistry>) -> Arc<ConnectionPool> {
        let connector = Arc::new(Connector::new(TransportSettings::default(), detached_events(), Vec::new()));
        let listener: Weak<dyn PoolEventListener> = Weak::<NoListener>::new();
        ConnectionPool::new(address, settings, connector, listener, metrics)
    }

    fn pool(address: ServerAddress, settings: PoolSettings) -> Arc<ConnectionPool> {
        pool_with(address, settings, Arc::new(NoopMetricsRegistry))
    }

    fn bounded(max_active: i32, exhausted_action: ExhaustedAction, max_wait: Option<Duration>) -> PoolSettings {
        PoolSettings {
            max_active,
            exhausted_action,
            max_wait,
            max_pending_requests: 5,
        }
    }

    fn assert_bounds(pool: &ConnectionPool, max: i32) {
        let active = pool.active();
        let created = pool.created();
        assert!(0 <= active, "active {} < 0", active);
        assert!(active <= created, "active {} > created {}", active, created);
        assert!(created <= max, "created {} > max {}", created, max);
    }

    #[tokio::test]
    async fn test_idle_connections_are_reused_lifo() {
        let server = MockServer::start().await;
        let pool = pool(server.address(), PoolSettings::default());

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.created(), 2);

        pool.release(Arc::clone(&first));
        pool.release(Arc::clone(&second));
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.active(), 0);

        let reused = pool.acquire().await.unwrap();
        assert_eq!(reused.id(), second.id());
        assert_eq!(pool.created(), 2);
        pool.close();
    }

    #[tokio::test]
    async fn test_pool_bounds_hold() {
        let server = MockServer::start().await;
        let pool = pool(server.address(), bounded(2, ExhaustedAction::Exception, None));

        let a = pool.acquire().await.unwrap();
        assert_bounds(&pool, 2);
        let b = pool.acquire().await.unwrap();
        assert_bounds(&pool, 2);
        assert!(matches!(pool.acquire().await, Err(HotRodError::PoolExhausted { .. })));
        assert_bounds(&pool, 2);

        pool.release(Arc::clone(&a));
        assert_bounds(&pool, 2);
        // Releasing an idle connection is a logged no-op
        pool.release(Arc::clone(&a));
        assert_bounds(&pool, 2);
        assert_eq!(pool.active(), 1);

        b.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_bounds(&pool, 2);
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.active(), 0);

        // Release after close does not double count
        pool.release(b);
        assert_bounds(&pool, 2);
        assert_eq!(pool.created(), 1);

        a.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.connected(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn test_wait_is_granted_on_release() {
        let server = MockServer::start().await;
        let pool = pool(
            server.address(),
            bounded(1, ExhaustedAction::Wait, Some(Duration::from_millis(5000))),
        );

        let first = pool.acquire().await.unwrap();
        let waiting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.waiting(), 1);
        pool.release(Arc::clone(&first));

        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second.id(), first.id());
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.active(), 1);
        pool.close();
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let server = MockServer::start().await;
        let pool = pool(server.address(), bounded(1, ExhaustedAction::Wait, None));
        let connection = pool.acquire().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for waiter in 0..2 {
            let task_pool = Arc::clone(&pool);
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                let connection = task_pool.acquire().await.unwrap();
                order_tx.send(waiter).unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                task_pool.release(connection);
            }));
            // Make sure the first waiter is queued first
            while pool.waiting() <= waiter {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        pool.release(connection);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(order_rx.recv().await, Some(0));
        assert_eq!(order_rx.recv().await, Some(1));
        pool.close();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let server = MockServer::start().await;
        let pool = pool(
            server.address(),
            bounded(1, ExhaustedAction::Wait, Some(Duration::from_millis(50))),
        );
        let held = pool.acquire().await.unwrap();

        let result = pool.acquire().await;
        assert!(matches!(result, Err(HotRodError::Timeout { .. })));
        assert_eq!(pool.waiting(), 0);

        // The timed out waiter is not handed the connection later
        pool.release(held);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.active(), 0);
        pool.close();
    }

    #[tokio::test]
    async fn test_create_new_exceeds_cap() {
        let server = MockServer::start().await;
        let pool = pool(server.address(), bounded(1, ExhaustedAction::CreateNew, None));
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.active(), 2);
        pool.close();
    }

    #[tokio::test]
    async fn test_connect_failure_restores_counters() {
        let pool = pool(unused_address().await, bounded(1, ExhaustedAction::Wait, None));
        let result = pool.acquire().await;
        assert!(matches!(result, Err(HotRodError::Transport { .. })));
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_pool_gauges() {
        let server = MockServer::start().await;
        let metrics = Arc::new(InMemoryMetricsRegistry::new());
        let pool = pool_with(server.address(), PoolSettings::default(), metrics.clone());
        let tags = [("server", server.address().to_string())];

        let connection = pool.acquire().await.unwrap();
        assert_eq!(metrics.gauge_value(POOL_ACTIVE, &tags), Some(1));
        assert_eq!(metrics.gauge_value(POOL_CONNECTED, &tags), Some(1));
        pool.release(connection);
        assert_eq!(metrics.gauge_value(POOL_IDLE, &tags), Some(1));

        pool.close();
        assert_eq!(metrics.gauge_value(POOL_ACTIVE, &tags), None);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let server = MockServer::start().await;
        let pool = pool(server.address(), PoolSettings::default());
        pool.close();
        assert!(matches!(pool.acquire().await, Err(HotRodError::Transport { .. })));
    }
}
