//! In-process Hot Rod server and transport stubs for tests

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::core::{ClientIntelligence, ServerAddress};
use crate::error::{DecodeError, HotRodError};
use crate::event::{ClientEvent, CounterEvent};
use crate::protocol::wire::{write_array, write_string, write_vint, write_vlong};
use crate::protocol::*;
use crate::topology::ClientTopology;
use crate::transport::TransportEvents;

/// Transport events that go nowhere
pub(crate) struct NoopEvents;

impl TransportEvents for NoopEvents {
    fn client_topology(&self, _cache_name: &str) -> ClientTopology {
        ClientTopology {
            topology_id: DEFAULT_CACHE_TOPOLOGY,
            intelligence: ClientIntelligence::Basic,
        }
    }

    fn receive_topology(&self, _address: &ServerAddress, _cache_name: &str, _operation_id: u64, _update: &TopologyUpdate) {}

    fn cache_event(&self, _address: &ServerAddress, _listener_id: &[u8], _event: ClientEvent) {}

    fn counter_event(&self, _event: CounterEvent) {}

    fn listeners_lost(&self, _address: &ServerAddress) {}

    fn connection_established(&self, _address: &ServerAddress) {}

    fn connection_failed(&self, _address: &ServerAddress, _error: &HotRodError) {}

    fn connection_closed(&self, _address: &ServerAddress, _cause: &HotRodError) {}
}

/// Events handle that never upgrades; connections fall back to defaults
pub(crate) fn detached_events() -> Weak<dyn TransportEvents> {
    Weak::<NoopEvents>::new()
}

/// An address nothing listens on
pub(crate) async fn unused_address() -> ServerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ServerAddress::new("127.0.0.1", port)
}

#[derive(Debug, Clone)]
struct MockTopology {
    id: i32,
    servers: Vec<ServerAddress>,
}

struct MockState {
    entries: Mutex<HashMap<Bytes, Bytes>>,
    /// Version advertised in ping responses, 0 echoes the request
    server_version: AtomicU8,
    fail_pings: AtomicBool,
    /// Status of an error response sent for every non-ping request
    error_status: Mutex<Option<u8>>,
    gets_held: watch::Sender<bool>,
    held: AtomicUsize,
    requests: Mutex<HashMap<u8, usize>>,
    topology: Mutex<Option<MockTopology>>,
    /// Key of a created event pushed after each listener registration
    listener_event: Mutex<Option<Bytes>>,
    connections: AtomicUsize,
    accept: Mutex<Option<AbortHandle>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Minimal Hot Rod server speaking versions 2.8 to 3.1
pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<MockState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (gets_held, _) = watch::channel(false);
        let state = Arc::new(MockState {
            entries: Mutex::new(HashMap::new()),
            server_version: AtomicU8::new(0),
            fail_pings: AtomicBool::new(false),
            error_status: Mutex::new(None),
            gets_held,
            held: AtomicUsize::new(0),
            requests: Mutex::new(HashMap::new()),
            topology: Mutex::new(None),
            listener_event: Mutex::new(None),
            connections: AtomicUsize::new(0),
            accept: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let handle = tokio::spawn(serve(stream, Arc::clone(&accept_state)));
                accept_state.tasks.lock().push(handle.abort_handle());
            }
        });
        *state.accept.lock() = Some(accept.abort_handle());

        Self {
            address: ServerAddress::new("127.0.0.1", port),
            state,
        }
    }

    pub fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.state
            .entries
            .lock()
            .insert(Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes()));
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.entries.lock().get(key.as_bytes()).cloned()
    }

    pub fn set_server_version(&self, version: u8) {
        self.state.server_version.store(version, Ordering::SeqCst);
    }

    pub fn fail_pings(&self) {
        self.state.fail_pings.store(true, Ordering::SeqCst);
    }

    /// Answer every request except pings with an error carrying `status`
    pub fn fail_requests_with(&self, status: u8) {
        *self.state.error_status.lock() = Some(status);
    }

    /// Park get requests until [`MockServer::release_gets`]
    pub fn hold_gets(&self) {
        self.state.gets_held.send_replace(true);
    }

    pub fn release_gets(&self) {
        self.state.gets_held.send_replace(false);
    }

    pub async fn wait_for_held_requests(&self, count: usize) {
        while self.state.held.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Advertise a topology to topology-aware clients with a different id
    pub fn set_topology(&self, id: i32, servers: Vec<ServerAddress>) {
        *self.state.topology.lock() = Some(MockTopology { id, servers });
    }

    pub fn emit_event_after_listener(&self, key: &str) {
        *self.state.listener_event.lock() = Some(Bytes::copy_from_slice(key.as_bytes()));
    }

    pub fn request_count(&self, op_code: u8) -> usize {
        self.state.requests.lock().get(&op_code).copied().unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Drop the listener and every open connection
    pub fn stop(&self) {
        if let Some(accept) = self.state.accept.lock().take() {
            accept.abort();
        }
        self.drop_connections();
    }

    /// Close every open connection but keep accepting new ones
    pub fn drop_connections(&self) {
        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct Request {
    message_id: u64,
    version: u8,
    op_code: u8,
    flags: u32,
    intelligence: u8,
    topology_id: i32,
    key: Bytes,
    value: Bytes,
    listener_id: Bytes,
}

fn read_factory(reader: &mut Reader<'_>) -> Result<(), DecodeError> {
    if !reader.read_string()?.is_empty() {
        let params = reader.read_u8()?;
        for _ in 0..params {
            reader.read_array()?;
        }
    }
    Ok(())
}

fn parse_request(reader: &mut Reader<'_>) -> Result<Request, DecodeError> {
    let magic = reader.read_u8()?;
    if magic != REQUEST_MAGIC {
        return Err(DecodeError::InvalidMagic {
            expected: REQUEST_MAGIC,
            actual: magic,
        });
    }
    let message_id = reader.read_vlong()?;
    let version = reader.read_u8()?;
    let op_code = reader.read_u8()?;
    let _cache = reader.read_array()?;
    let flags = reader.read_vint()?;
    let intelligence = reader.read_u8()?;
    let topology_id = reader.read_vint()? as i32;
    if version >= VERSION_30 {
        reader.read_u8()?;
        reader.read_u8()?;
    }

    let mut request = Request {
        message_id,
        version,
        op_code,
        flags,
        intelligence,
        topology_id,
        key: Bytes::new(),
        value: Bytes::new(),
        listener_id: Bytes::new(),
    };
    match op_code {
        GET_REQUEST | CONTAINS_KEY_REQUEST | REMOVE_REQUEST => request.key = reader.read_array()?,
        PUT_REQUEST | PUT_IF_ABSENT_REQUEST | REPLACE_REQUEST => {
            request.key = reader.read_array()?;
            let units = reader.read_u8()?;
            for unit in [units >> 4, units & 0x0F] {
                if unit != 0x07 && unit != 0x08 {
                    reader.read_vlong()?;
                }
            }
            request.value = reader.read_array()?;
        }
        ADD_CLIENT_LISTENER_REQUEST => {
            request.listener_id = reader.read_array()?;
            reader.read_u8()?;
            read_factory(reader)?;
            read_factory(reader)?;
            reader.read_u8()?;
            if version >= VERSION_30 {
                reader.read_vint()?;
            }
        }
        REMOVE_CLIENT_LISTENER_REQUEST => request.listener_id = reader.read_array()?,
        _ => {}
    }
    Ok(request)
}

async fn serve(mut stream: TcpStream, state: Arc<MockState>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        loop {
            let parsed = {
                let mut reader = Reader::new(&buf[..]);
                parse_request(&mut reader).map(|request| (request, reader.position()))
            };
            let (request, consumed) = match parsed {
                Ok(parsed) => parsed,
                Err(DecodeError::Incomplete) => break,
                Err(_) => return,
            };
            let _ = buf.split_to(consumed);

            *state.requests.lock().entry(request.op_code).or_insert(0) += 1;
            if request.op_code == GET_REQUEST && *state.gets_held.borrow() {
                let mut released = state.gets_held.subscribe();
                state.held.fetch_add(1, Ordering::SeqCst);
                let _ = released.wait_for(|held| !*held).await;
                state.held.fetch_sub(1, Ordering::SeqCst);
            }

            let out = respond(&state, &request);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
    }
}

fn write_response_header(out: &mut BytesMut, state: &MockState, request: &Request, op_code: u8, status: u8) {
    out.put_u8(RESPONSE_MAGIC);
    write_vlong(out, request.message_id);
    out.put_u8(op_code);
    out.put_u8(status);

    let topology = state.topology.lock().clone();
    match topology {
        Some(topology)
            if request.intelligence >= ClientIntelligence::TopologyAware.value()
                && topology.id != request.topology_id =>
        {
            out.put_u8(1);
            write_vint(out, topology.id as u32);
            write_vint(out, topology.servers.len() as u32);
            for server in &topology.servers {
                write_string(out, server.host());
                out.put_u16(server.port());
            }
            if request.intelligence == ClientIntelligence::HashDistributionAware.value() {
                // One segment per server, each owned by that server
                out.put_u8(3);
                write_vint(out, topology.servers.len() as u32);
                for index in 0..topology.servers.len() {
                    out.put_u8(1);
                    write_vint(out, index as u32);
                }
            }
        }
        _ => out.put_u8(0),
    }
}

fn respond(state: &MockState, request: &Request) -> BytesMut {
    let mut out = BytesMut::new();
    let return_previous = request.flags & FORCE_RETURN_VALUE != 0;
    let ok = |out: &mut BytesMut, status: u8| write_response_header(out, state, request, request.op_code + 1, status);

    let error_status = *state.error_status.lock();
    if let Some(status) = error_status.filter(|_| request.op_code != PING_REQUEST) {
        write_response_header(&mut out, state, request, ERROR_RESPONSE, status);
        write_string(&mut out, "scripted failure");
        return out;
    }

    match request.op_code {
        PING_REQUEST => {
            if state.fail_pings.load(Ordering::SeqCst) {
                write_response_header(&mut out, state, request, ERROR_RESPONSE, SERVER_ERROR_STATUS);
                write_string(&mut out, "ping refused");
                return out;
            }
            ok(&mut out, NO_ERROR_STATUS);
            if request.version >= VERSION_30 {
                out.put_u8(0);
                out.put_u8(0);
                let advertised = match state.server_version.load(Ordering::SeqCst) {
                    0 => request.version,
                    version => version,
                };
                out.put_u8(advertised);
                write_vint(&mut out, 0);
            }
        }
        GET_REQUEST => match state.entries.lock().get(&request.key).cloned() {
            Some(value) => {
                ok(&mut out, NO_ERROR_STATUS);
                write_array(&mut out, &value);
            }
            None => ok(&mut out, KEY_DOES_NOT_EXIST_STATUS),
        },
        PUT_REQUEST => {
            let previous = state.entries.lock().insert(request.key.clone(), request.value.clone());
            match previous {
                Some(previous) if return_previous => {
                    ok(&mut out, SUCCESS_WITH_PREVIOUS);
                    write_array(&mut out, &previous);
                }
                _ => ok(&mut out, NO_ERROR_STATUS),
            }
        }
        PUT_IF_ABSENT_REQUEST => {
            let mut entries = state.entries.lock();
            match entries.get(&request.key).cloned() {
                Some(existing) if return_previous => {
                    ok(&mut out, NOT_EXECUTED_WITH_PREVIOUS);
                    write_array(&mut out, &existing);
                }
                Some(_) => ok(&mut out, NOT_PUT_REMOVED_REPLACED_STATUS),
                None => {
                    entries.insert(request.key.clone(), request.value.clone());
                    ok(&mut out, NO_ERROR_STATUS);
                }
            }
        }
        REPLACE_REQUEST => {
            let mut entries = state.entries.lock();
            match entries.get(&request.key).cloned() {
                Some(existing) => {
                    entries.insert(request.key.clone(), request.value.clone());
                    if return_previous {
                        ok(&mut out, SUCCESS_WITH_PREVIOUS);
                        write_array(&mut out, &existing);
                    } else {
                        ok(&mut out, NO_ERROR_STATUS);
                    }
                }
                None => ok(&mut out, NOT_PUT_REMOVED_REPLACED_STATUS),
            }
        }
        REMOVE_REQUEST => {
            let removed = state.entries.lock().remove(&request.key);
            match removed {
                Some(previous) if return_previous => {
                    ok(&mut out, SUCCESS_WITH_PREVIOUS);
                    write_array(&mut out, &previous);
                }
                Some(_) => ok(&mut out, NO_ERROR_STATUS),
                None => ok(&mut out, KEY_DOES_NOT_EXIST_STATUS),
            }
        }
        CONTAINS_KEY_REQUEST => {
            let found = state.entries.lock().contains_key(&request.key);
            ok(&mut out, if found { NO_ERROR_STATUS } else { KEY_DOES_NOT_EXIST_STATUS });
        }
        CLEAR_REQUEST => {
            state.entries.lock().clear();
            ok(&mut out, NO_ERROR_STATUS);
        }
        SIZE_REQUEST => {
            let size = state.entries.lock().len();
            ok(&mut out, NO_ERROR_STATUS);
            write_vlong(&mut out, size as u64);
        }
        ADD_CLIENT_LISTENER_REQUEST => {
            ok(&mut out, NO_ERROR_STATUS);
            if let Some(key) = state.listener_event.lock().clone() {
                out.put_u8(RESPONSE_MAGIC);
                let echoed = if request.version >= VERSION_30 { request.message_id } else { 0 };
                write_vlong(&mut out, echoed);
                out.put_u8(CACHE_ENTRY_CREATED_EVENT);
                out.put_u8(NO_ERROR_STATUS);
                out.put_u8(0);
                write_array(&mut out, &request.listener_id);
                out.put_u8(0);
                out.put_u8(0);
                write_array(&mut out, &key);
                out.put_i64(1);
            }
        }
        REMOVE_CLIENT_LISTENER_REQUEST => ok(&mut out, NO_ERROR_STATUS),
        other => {
            write_response_header(&mut out, state, request, ERROR_RESPONSE, UNKNOWN_COMMAND_STATUS);
            write_string(&mut out, &format!("Unknown operation {:#04x}", other));
        }
    }
    out
}
