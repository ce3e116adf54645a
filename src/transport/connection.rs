//! One physical connection to one server
//!
//! Every write goes through the connection's writer task: callers hand it
//! closures that encode into the shared outbound buffer, and the task flushes
//! once per batch of closures. A second task reads the socket and runs the
//! decoder. Operations are registered under their message id before their
//! bytes are written.

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use socket2::SockRef;
use std::collections::hash_map::Entry;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::activation::ActivationStep;
use super::decoder::{DecoderSink, HeaderDecoder, Registration};
use super::{TransportEvents, TransportSettings};
use crate::core::{ClientIntelligence, ServerAddress};
use crate::error::{HotRodError, HotRodResult};
use crate::event::{ClientEvent, CounterEvent};
use crate::operations::{ListenerEffect, QueuedOperation};
use crate::protocol::{codec_for_version, Codec, TopologyUpdate, DEFAULT_CACHE_TOPOLOGY};
use crate::topology::ClientTopology;

/// Work run on the connection's writer task
pub(crate) type WriteTask = Box<dyn FnOnce(&mut WriteContext<'_>) + Send>;

// Pool record state bits
const RECORD_IDLE: u8 = 0b01;
const RECORD_CLOSED: u8 = 0b10;

const READ_BUFFER_SIZE: usize = 8192;

/// Unanswered abandoned requests tolerated before the connection is dropped
const MAX_ABANDONED: usize = 64;

/// What a pool release found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseState {
    Released,
    AlreadyIdle,
    Closed,
}

/// Access to the outbound buffer from inside the writer task
pub(crate) struct WriteContext<'a> {
    out: &'a mut BytesMut,
    connection: &'a Arc<WireConnection>,
}

impl<'a> WriteContext<'a> {
    pub fn connection(&self) -> &Arc<WireConnection> {
        self.connection
    }

    /// Register `operation` under a fresh message id and encode it
    pub fn write_operation(&mut self, operation: QueuedOperation) -> HotRodResult<u64> {
        self.connection.register_and_encode(operation, self.out)
    }
}

#[derive(Debug, Default)]
struct Registry {
    operations: FnvHashMap<u64, Registration>,
    /// Given up by the dispatcher; kept only to consume a late response
    abandoned: FnvHashMap<u64, Registration>,
    /// Listeners whose registration completed on this connection
    listeners: HashSet<Bytes>,
    /// Listener registration currently in flight
    listener_registration: Option<u64>,
    accepting: bool,
    closed: bool,
}

pub struct WireConnection {
    id: u64,
    address: ServerAddress,
    commands: mpsc::UnboundedSender<WriteTask>,
    codec: RwLock<Arc<dyn Codec>>,
    next_message_id: AtomicU64,
    registry: Mutex<Registry>,
    drained: Notify,
    record_state: AtomicU8,
    closed: watch::Sender<bool>,
    close_cause: Mutex<Option<HotRodError>>,
    events: Weak<dyn TransportEvents>,
}

impl WireConnection {
    /// Start the reader and writer tasks for an open stream
    pub(crate) fn spawn(
        id: u64,
        address: ServerAddress,
        stream: TcpStream,
        codec: Arc<dyn Codec>,
        events: Weak<dyn TransportEvents>,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id,
            address,
            commands,
            codec: RwLock::new(codec),
            next_message_id: AtomicU64::new(1),
            registry: Mutex::new(Registry {
                accepting: true,
                ..Registry::default()
            }),
            drained: Notify::new(),
            record_state: AtomicU8::new(0),
            closed,
            close_cause: Mutex::new(None),
            events,
        });

        let (reader, writer) = stream.into_split();
        tokio::spawn(Arc::clone(&connection).read_loop(reader, idle_timeout));
        tokio::spawn(Arc::clone(&connection).write_loop(writer, receiver));
        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn codec(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.codec.read())
    }

    /// Switch protocol version after negotiation
    pub fn install_codec(&self, codec: Arc<dyn Codec>) {
        debug!(
            address = %self.address,
            connection = self.id,
            version = codec.version(),
            "Installing negotiated codec"
        );
        *self.codec.write() = codec;
    }

    pub fn is_active(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Open and still taking new operations
    pub fn is_writable(&self) -> bool {
        let registry = self.registry.lock();
        registry.accepting && !registry.closed && !self.commands.is_closed()
    }

    pub fn registered_operations(&self) -> usize {
        self.registry.lock().operations.len()
    }

    /// Cause of a close that was not requested
    pub fn close_cause(&self) -> Option<HotRodError> {
        self.close_cause.lock().clone()
    }

    /// Queue work for the writer task; false once the writer has stopped
    pub(crate) fn execute(&self, task: WriteTask) -> bool {
        self.commands.send(task).is_ok()
    }

    /// Write `operation` directly, bypassing any channel queue
    pub(crate) fn force_send(&self, operation: QueuedOperation) {
        let pending = operation.clone();
        let queued = self.execute(Box::new(move |ctx| {
            if let Err(e) = ctx.write_operation(operation.clone()) {
                let address = ctx.connection().address().clone();
                operation.fail(e, Some(&address));
            }
        }));
        if !queued {
            pending.fail(HotRodError::transport(&self.address, "Connection closed"), Some(&self.address));
        }
    }

    /// Register an operation; fails if the id is taken or the connection is closing
    pub(crate) fn register(&self, message_id: u64, registration: Registration) -> HotRodResult<()> {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        if !registry.accepting || registry.closed {
            return Err(HotRodError::transport(&self.address, "Connection is closing"));
        }
        let is_listener = matches!(
            registration.operation.op.listener_effect(),
            Some(ListenerEffect::Add(_))
        );
        match registry.operations.entry(message_id) {
            Entry::Occupied(_) => Err(HotRodError::internal(format!(
                "Message id {} already registered on connection {}",
                message_id, self.id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(registration);
                if is_listener {
                    registry.listener_registration = Some(message_id);
                }
                Ok(())
            }
        }
    }

    fn register_and_encode(self: &Arc<Self>, operation: QueuedOperation, out: &mut BytesMut) -> HotRodResult<u64> {
        let topology = match self.events.upgrade() {
            Some(events) => events.client_topology(operation.op.cache_name()),
            None => ClientTopology {
                topology_id: DEFAULT_CACHE_TOPOLOGY,
                intelligence: ClientIntelligence::Basic,
            },
        };
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        self.register(
            message_id,
            Registration {
                operation: operation.clone(),
                intelligence: topology.intelligence,
            },
        )?;

        let codec = self.codec();
        operation.op.encode(codec.as_ref(), message_id, topology, out);
        trace!(
            address = %self.address,
            message_id,
            operation = operation.op.name(),
            id = operation.op.id(),
            topology_id = topology.topology_id,
            "Wrote operation"
        );
        if !operation.op.written(operation.attempt, self, message_id) {
            self.abandon(message_id);
        }
        Ok(message_id)
    }

    /// Stop counting `message_id` as pending. A late response is still read
    /// and dropped; too many of them and the connection is closed.
    pub(crate) fn abandon(&self, message_id: u64) {
        let (drained, abandoned) = {
            let mut registry = self.registry.lock();
            let Some(registration) = registry.operations.remove(&message_id) else {
                return;
            };
            if registry.listener_registration == Some(message_id) {
                registry.listener_registration = None;
            }
            registry.abandoned.insert(message_id, registration);
            (registry.operations.is_empty(), registry.abandoned.len())
        };
        trace!(address = %self.address, connection = self.id, message_id, abandoned, "Abandoned request");
        if drained {
            self.drained.notify_waiters();
        }
        if abandoned > MAX_ABANDONED {
            warn!(
                address = %self.address,
                connection = self.id,
                abandoned,
                "Server is not answering, closing connection"
            );
            self.shutdown(Some(HotRodError::transport(&self.address, "Too many unanswered requests")));
        }
    }

    /// Close now, failing everything registered
    pub fn close(&self) {
        self.shutdown(None);
    }

    /// Stop taking operations, wait for the registered ones, then close
    pub async fn close_gracefully(&self) {
        self.registry.lock().accepting = false;
        loop {
            let drained = self.drained.notified();
            let empty = self.registry.lock().operations.is_empty();
            if empty || !self.is_active() {
                break;
            }
            tokio::select! {
                _ = drained => {}
                _ = self.closed() => break,
            }
        }
        debug!(address = %self.address, connection = self.id, "Closing connection gracefully");
        self.shutdown(None);
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }

    fn shutdown(&self, cause: Option<HotRodError>) {
        let (failed, had_listeners) = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return;
            }
            registry.closed = true;
            registry.accepting = false;
            registry.listener_registration = None;
            registry.abandoned.clear();
            let failed: Vec<Registration> = registry.operations.drain().map(|(_, r)| r).collect();
            (failed, !registry.listeners.is_empty())
        };
        *self.close_cause.lock() = cause.clone();
        self.closed.send_replace(true);
        self.drained.notify_waiters();

        match &cause {
            Some(error) => debug!(
                address = %self.address,
                connection = self.id,
                error = %error,
                failed = failed.len(),
                "Connection closed with error"
            ),
            None => trace!(address = %self.address, connection = self.id, "Connection closed"),
        }

        if !failed.is_empty() {
            let error = match cause {
                Some(error @ HotRodError::Transport { .. }) => error,
                Some(other) => HotRodError::transport(&self.address, other.to_string()),
                None => HotRodError::transport(&self.address, "Connection closed"),
            };
            for registration in failed {
                registration.operation.fail(error.clone(), Some(&self.address));
            }
        }

        if had_listeners {
            if let Some(events) = self.events.upgrade() {
                events.listeners_lost(&self.address);
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, idle_timeout: Option<Duration>) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut decoder = HeaderDecoder::new();
        let mut closed = self.closed.subscribe();

        let cause = loop {
            let read = async {
                match idle_timeout {
                    Some(limit) => timeout(limit, reader.read_buf(&mut buf)).await.ok(),
                    None => Some(reader.read_buf(&mut buf).await),
                }
            };
            tokio::select! {
                _ = wait_closed(&mut closed) => break None,
                result = read => match result {
                    None => {
                        if self.registered_operations() == 0 {
                            debug!(address = %self.address, connection = self.id, "Closing idle connection");
                            break None;
                        }
                    }
                    Some(Ok(0)) => {
                        break Some(HotRodError::transport(&self.address, "Connection closed by server"));
                    }
                    Some(Ok(_)) => {
                        if let Err(e) = decoder.decode(&mut buf, &*self) {
                            warn!(
                                address = %self.address,
                                connection = self.id,
                                error = %e,
                                buffered = %crate::utils::limited_hex_dump(&buf, 64),
                                "Failed to decode response"
                            );
                            break Some(e);
                        }
                    }
                    Some(Err(e)) => break Some(HotRodError::io(&self.address, &e)),
                },
            }
        };
        self.shutdown(cause);
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf, mut commands: mpsc::UnboundedReceiver<WriteTask>) {
        let mut out = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut closed = self.closed.subscribe();

        loop {
            let task = tokio::select! {
                _ = wait_closed(&mut closed) => break,
                task = commands.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.run_task(task, &mut out);
            // Work queued meanwhile joins the same flush
            while let Ok(task) = commands.try_recv() {
                self.run_task(task, &mut out);
            }
            if out.is_empty() {
                continue;
            }

            let result = write_out(&mut writer, &out).await;
            out.clear();
            if let Err(e) = result {
                self.shutdown(Some(HotRodError::io(&self.address, &e)));
                break;
            }
        }

        // Tasks still queued run against a closed registry so their
        // operations are handed back instead of dropped
        commands.close();
        while let Some(task) = commands.recv().await {
            self.run_task(task, &mut out);
        }
        let _ = writer.shutdown().await;
    }

    fn run_task(self: &Arc<Self>, task: WriteTask, out: &mut BytesMut) {
        let mut ctx = WriteContext { out, connection: self };
        task(&mut ctx);
    }

    pub(crate) fn set_acquired(&self) -> bool {
        self.record_state
            .compare_exchange(RECORD_IDLE, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.record_state.load(Ordering::Acquire) & RECORD_IDLE != 0
    }

    /// Mark the record idle on release
    pub(crate) fn mark_idle(&self) -> ReleaseState {
        match self
            .record_state
            .compare_exchange(0, RECORD_IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => ReleaseState::Released,
            Err(state) if state & RECORD_CLOSED != 0 => ReleaseState::Closed,
            Err(_) => ReleaseState::AlreadyIdle,
        }
    }

    /// Record the close; `Some(was_idle)` the first time only
    pub(crate) fn mark_closed(&self) -> Option<bool> {
        let previous = self.record_state.fetch_or(RECORD_CLOSED, Ordering::AcqRel);
        if previous & RECORD_CLOSED != 0 {
            None
        } else {
            Some(previous & RECORD_IDLE != 0)
        }
    }

    pub(crate) fn is_record_closed(&self) -> bool {
        self.record_state.load(Ordering::Acquire) & RECORD_CLOSED != 0
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn write_out(writer: &mut OwnedWriteHalf, out: &[u8]) -> io::Result<()> {
    writer.write_all(out).await?;
    writer.flush().await
}

impl std::fmt::Debug for WireConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("active", &self.is_active())
            .field("registered", &self.registered_operations())
            .finish()
    }
}

impl DecoderSink for WireConnection {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    fn codec(&self) -> Arc<dyn Codec> {
        WireConnection::codec(self)
    }

    fn registration(&self, message_id: u64) -> Option<Registration> {
        let registry = self.registry.lock();
        registry
            .operations
            .get(&message_id)
            .or_else(|| registry.abandoned.get(&message_id))
            .cloned()
    }

    fn unregister(&self, message_id: u64) -> Option<Registration> {
        let (removed, drained) = {
            let mut registry = self.registry.lock();
            if let Some(abandoned) = registry.abandoned.remove(&message_id) {
                return Some(abandoned);
            }
            let removed = registry.operations.remove(&message_id);
            if registry.listener_registration == Some(message_id) {
                registry.listener_registration = None;
            }
            (removed, registry.operations.is_empty())
        };
        if drained {
            self.drained.notify_waiters();
        }
        removed
    }

    fn pending_listener_registration(&self) -> Option<u64> {
        self.registry.lock().listener_registration
    }

    fn apply_listener_effect(&self, effect: ListenerEffect) {
        let mut registry = self.registry.lock();
        match effect {
            ListenerEffect::Add(listener_id) => {
                registry.listeners.insert(listener_id);
            }
            ListenerEffect::Remove(listener_id) => {
                registry.listeners.remove(&listener_id);
            }
        }
    }

    fn topology(&self, cache_name: &str, operation_id: u64, update: &TopologyUpdate) {
        if let Some(events) = self.events.upgrade() {
            events.receive_topology(&self.address, cache_name, operation_id, update);
        }
    }

    fn cache_event(&self, listener_id: &[u8], event: ClientEvent) {
        if let Some(events) = self.events.upgrade() {
            events.cache_event(&self.address, listener_id, event);
        }
    }

    fn counter_event(&self, event: CounterEvent) {
        if let Some(events) = self.events.upgrade() {
            events.counter_event(event);
        }
    }
}

/// Opens connections and runs their activation steps
pub(crate) struct Connector {
    settings: TransportSettings,
    events: Weak<dyn TransportEvents>,
    activation: Vec<Arc<dyn ActivationStep>>,
    next_id: AtomicU64,
}

impl Connector {
    pub fn new(
        settings: TransportSettings,
        events: Weak<dyn TransportEvents>,
        activation: Vec<Arc<dyn ActivationStep>>,
    ) -> Self {
        Self {
            settings,
            events,
            activation,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Connect and activate; the returned connection is ready for operations
    pub async fn connect(&self, address: &ServerAddress) -> HotRodResult<Arc<WireConnection>> {
        debug!(address = %address, "Connecting");
        let target = (address.host(), address.port());
        let stream = match timeout(self.settings.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "Connection attempt failed");
                return Err(HotRodError::io(address, &e));
            }
            Err(_) => {
                debug!(address = %address, "Timeout connecting");
                return Err(HotRodError::transport(
                    address,
                    format!("Connect timed out after {:?}", self.settings.connect_timeout),
                ));
            }
        };

        if let Err(e) = self.configure_stream(&stream) {
            warn!(address = %address, error = %e, "Failed to configure socket options");
        }

        let codec = codec_for_version(self.settings.protocol_version).ok_or_else(|| {
            HotRodError::internal(format!("Unsupported protocol version {}", self.settings.protocol_version))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = WireConnection::spawn(
            id,
            address.clone(),
            stream,
            codec,
            self.events.clone(),
            self.settings.idle_timeout,
        );

        for step in &self.activation {
            if let Err(e) = step.activate(&connection).await {
                warn!(address = %address, step = step.name(), error = %e, "Connection activation failed");
                connection.close();
                return Err(match e {
                    transport @ HotRodError::Transport { .. } => transport,
                    other => HotRodError::transport(
                        address,
                        format!("Activation step '{}' failed: {}", step.name(), other),
                    ),
                });
            }
        }

        debug!(address = %address, connection = id, "Connection activated");
        Ok(connection)
    }

    fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.settings.tcp_no_delay)?;
        if self.settings.tcp_keep_alive {
            SockRef::from(stream).set_keepalive(true)?;
        }
        Ok(())
    }
}
