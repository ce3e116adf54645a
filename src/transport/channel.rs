//! Per-server operation queue drained onto pooled connections

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use super::connection::{Connector, WriteContext, WriteTask};
use super::pool::{ConnectionPool, PoolEvent, PoolEventListener};
use super::{PoolSettings, TransportEvents};
use crate::core::ServerAddress;
use crate::error::{HotRodError, HotRodResult};
use crate::metrics::MetricsRegistry;
use crate::operations::QueuedOperation;

#[derive(Default)]
struct ChannelQueue {
    operations: VecDeque<QueuedOperation>,
    closed: bool,
}

/// Queue of operations bound for one server.
///
/// A single drain round is in flight at a time: it acquires a connection,
/// writes up to `batch_size` queued operations from the connection's writer
/// task and hands the connection back. Responses complete the operations
/// directly, the channel never waits for them.
pub(crate) struct OperationChannel {
    address: ServerAddress,
    pool: Arc<ConnectionPool>,
    queue: Mutex<ChannelQueue>,
    /// Set after a successful connect, cleared when the last connection fails
    accepting: AtomicBool,
    draining: AtomicBool,
    batch_size: usize,
    events: Weak<dyn TransportEvents>,
    me: Weak<OperationChannel>,
}

/// Clears the drain flag when a round ends, however it ends, and starts
/// another round if work arrived meanwhile
struct DrainGuard {
    channel: Arc<OperationChannel>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.channel.draining.store(false, Ordering::Release);
        self.channel.schedule_drain();
    }
}

impl OperationChannel {
    pub fn new(
        address: ServerAddress,
        connector: Arc<Connector>,
        pool_settings: PoolSettings,
        metrics: Arc<dyn MetricsRegistry>,
        events: Weak<dyn TransportEvents>,
    ) -> Arc<Self> {
        let batch_size = connector.settings().batch_size.max(1);
        Arc::new_cyclic(|me: &Weak<OperationChannel>| {
            let listener: Weak<dyn PoolEventListener> = me.clone();
            Self {
                pool: ConnectionPool::new(address.clone(), pool_settings, connector, listener, metrics),
                address,
                queue: Mutex::new(ChannelQueue::default()),
                accepting: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                batch_size,
                events,
                me: me.clone(),
            }
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn pending_operations(&self) -> usize {
        self.queue.lock().operations.len()
    }

    /// Queue an operation for the next drain round
    pub fn send_operation(&self, operation: QueuedOperation) {
        {
            let mut queue = self.queue.lock();
            if queue.closed {
                drop(queue);
                trace!(address = %self.address, operation = operation.op.name(), "Channel closed, resubmitting");
                operation.resubmit(HotRodError::transport(&self.address, "Channel closed"));
                return;
            }
            queue.operations.push_back(operation);
        }
        self.schedule_drain();
    }

    /// Open a first connection so failures surface before any operation
    pub async fn connect(&self) -> HotRodResult<()> {
        let connection = self.pool.acquire().await?;
        self.pool.release(connection);
        Ok(())
    }

    fn schedule_drain(&self) {
        if self.queue.lock().operations.is_empty() {
            return;
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.me.upgrade() {
            Some(channel) => {
                tokio::spawn(channel.drain_round());
            }
            None => self.draining.store(false, Ordering::Release),
        }
    }

    async fn drain_round(self: Arc<Self>) {
        let guard = DrainGuard {
            channel: Arc::clone(&self),
        };

        match self.pool.acquire().await {
            Ok(connection) => {
                let channel = Arc::clone(&self);
                let task: WriteTask = Box::new(move |ctx| {
                    channel.write_batch(ctx);
                    let connection = Arc::clone(ctx.connection());
                    channel.pool.release(connection);
                    drop(guard);
                });
                if !connection.execute(task) {
                    trace!(address = %self.address, connection = connection.id(), "Writer stopped before the batch ran");
                    self.pool.release(connection);
                }
            }
            Err(e) => {
                let failed: Vec<QueuedOperation> = self.queue.lock().operations.drain(..).collect();
                if !failed.is_empty() {
                    debug!(
                        address = %self.address,
                        error = %e,
                        failed = failed.len(),
                        "Could not acquire a connection for queued operations"
                    );
                }
                for operation in failed {
                    operation.fail(e.clone(), Some(&self.address));
                }
                drop(guard);
            }
        }
    }

    fn write_batch(&self, ctx: &mut WriteContext<'_>) {
        let batch: Vec<QueuedOperation> = {
            let mut queue = self.queue.lock();
            let count = queue.operations.len().min(self.batch_size);
            queue.operations.drain(..count).collect()
        };

        for operation in batch {
            if !operation.is_current() {
                trace!(address = %self.address, operation = operation.op.name(), "Skipping superseded attempt");
                continue;
            }
            if let Err(e) = ctx.write_operation(operation.clone()) {
                trace!(address = %self.address, error = %e, "Write refused, resubmitting");
                operation.resubmit(e);
            }
        }
    }

    fn handle_disconnect(&self, cause: &HotRodError) {
        let failed: Vec<QueuedOperation> = {
            let mut queue = self.queue.lock();
            if queue.closed {
                return;
            }
            queue.operations.drain(..).collect()
        };
        warn!(address = %self.address, error = %cause, failed = failed.len(), "Lost all connections");
        for operation in failed {
            operation.fail(cause.clone(), Some(&self.address));
        }

        if let Some(events) = self.events.upgrade() {
            events.connection_closed(&self.address, cause);
        }

        if self.accepting.swap(false, Ordering::AcqRel) {
            if let Some(channel) = self.me.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = channel.connect().await {
                        debug!(address = %channel.address, error = %e, "Reconnect failed");
                    }
                });
            }
        }
    }

    fn take_queue(&self) -> Vec<QueuedOperation> {
        let mut queue = self.queue.lock();
        queue.closed = true;
        queue.operations.drain(..).collect()
    }

    /// Close every connection now and hand back what was still queued
    pub fn close(&self) -> Vec<QueuedOperation> {
        let queued = self.take_queue();
        self.accepting.store(false, Ordering::Release);
        self.pool.close();
        queued
    }

    /// Stop taking work, let in-flight operations finish and hand back what
    /// was still queued
    pub fn close_gracefully(&self) -> Vec<QueuedOperation> {
        let queued = self.take_queue();
        debug!(address = %self.address, queued = queued.len(), "Closing channel gracefully");
        self.accepting.store(false, Ordering::Release);
        self.pool.close_gracefully();
        queued
    }
}

impl PoolEventListener for OperationChannel {
    fn on_pool_event(&self, address: &ServerAddress, event: PoolEvent<'_>) {
        match event {
            PoolEvent::Connected => {
                self.accepting.store(true, Ordering::Release);
                if let Some(events) = self.events.upgrade() {
                    events.connection_established(address);
                }
            }
            PoolEvent::ConnectFailed(error) => {
                if let Some(events) = self.events.upgrade() {
                    events.connection_failed(address, error);
                }
            }
            PoolEvent::Closed {
                cause: Some(cause),
                remaining: 0,
            } => self.handle_disconnect(cause),
            PoolEvent::Closed { .. } => {}
        }
    }
}

impl std::fmt::Debug for OperationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationChannel")
            .field("address", &self.address)
            .field("accepting", &self.is_accepting())
            .field("queued", &self.pending_operations())
            .finish()
    }
}
