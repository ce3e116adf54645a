//! Client listener events and their delivery
//!
//! Events are pushed by the server on the connection a listener was
//! registered through. The notifier maps listener ids to the application's
//! channel and to the server the listener is pinned to.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::ServerAddress;

/// Entry event delivered to a client listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Created { key: Bytes, version: i64, retried: bool },
    Modified { key: Bytes, version: i64, retried: bool },
    Removed { key: Bytes, retried: bool },
    Expired { key: Bytes },
    /// Event produced by a server-side converter
    Custom { kind: EventKind, data: Bytes, retried: bool },
    /// The connection carrying the listener closed; it must be registered again
    Failover,
}

/// Which entry change produced a custom event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Modified,
    Removed,
    Expired,
}

/// Bound state of a strong counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Valid,
    LowerBoundReached,
    UpperBoundReached,
}

impl CounterState {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0x01 => CounterState::LowerBoundReached,
            0x02 => CounterState::UpperBoundReached,
            _ => CounterState::Valid,
        }
    }
}

/// Counter value change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEvent {
    pub counter_name: String,
    pub listener_id: Bytes,
    pub old_value: i64,
    pub old_state: CounterState,
    pub new_value: i64,
    pub new_state: CounterState,
}

#[derive(Debug)]
struct ListenerRegistration {
    cache_name: String,
    address: Option<ServerAddress>,
    started: bool,
    sender: mpsc::UnboundedSender<ClientEvent>,
}

/// Routes server-pushed events to application listeners
#[derive(Debug, Default)]
pub struct ClientListenerNotifier {
    listeners: DashMap<Bytes, ListenerRegistration>,
    counter_listeners: DashMap<Bytes, mpsc::UnboundedSender<CounterEvent>>,
}

impl ClientListenerNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener before its registration request is sent
    pub fn add_listener(&self, listener_id: Bytes, cache_name: &str, sender: mpsc::UnboundedSender<ClientEvent>) {
        self.listeners.insert(
            listener_id,
            ListenerRegistration {
                cache_name: cache_name.to_string(),
                address: None,
                started: false,
                sender,
            },
        );
    }

    /// Pin a listener to the server its registration is being sent to
    pub fn bind_address(&self, listener_id: &[u8], address: &ServerAddress) {
        if let Some(mut registration) = self.listeners.get_mut(listener_id) {
            debug!(
                listener_id = %hex::encode(listener_id),
                cache = %registration.cache_name,
                address = %address,
                "Binding client listener"
            );
            registration.address = Some(address.clone());
        }
    }

    /// The server confirmed the registration
    pub fn start_listener(&self, listener_id: &[u8]) {
        if let Some(mut registration) = self.listeners.get_mut(listener_id) {
            registration.started = true;
        }
    }

    pub fn remove_listener(&self, listener_id: &[u8]) -> Option<ServerAddress> {
        self.listeners
            .remove(listener_id)
            .and_then(|(_, registration)| registration.address)
    }

    pub fn listener_address(&self, listener_id: &[u8]) -> Option<ServerAddress> {
        self.listeners
            .get(listener_id)
            .and_then(|registration| registration.address.clone())
    }

    pub fn is_started(&self, listener_id: &[u8]) -> bool {
        self.listeners
            .get(listener_id)
            .map(|registration| registration.started)
            .unwrap_or(false)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver an event received from `address`
    pub fn dispatch_event(&self, address: &ServerAddress, listener_id: &[u8], event: ClientEvent) {
        let closed = match self.listeners.get(listener_id) {
            Some(registration) => {
                if registration.address.as_ref() != Some(address) {
                    trace!(
                        listener_id = %hex::encode(listener_id),
                        address = %address,
                        "Dropping event from a server the listener is not bound to"
                    );
                    return;
                }
                registration.sender.send(event).is_err()
            }
            None => {
                trace!(listener_id = %hex::encode(listener_id), "Event for unknown listener");
                return;
            }
        };

        if closed {
            debug!(listener_id = %hex::encode(listener_id), "Listener receiver dropped, removing");
            self.listeners.remove(listener_id);
        }
    }

    pub fn add_counter_listener(&self, listener_id: Bytes, sender: mpsc::UnboundedSender<CounterEvent>) {
        self.counter_listeners.insert(listener_id, sender);
    }

    pub fn remove_counter_listener(&self, listener_id: &[u8]) -> bool {
        self.counter_listeners.remove(listener_id).is_some()
    }

    pub fn dispatch_counter_event(&self, event: CounterEvent) {
        let listener_id = event.listener_id.clone();
        let closed = match self.counter_listeners.get(&listener_id) {
            Some(sender) => sender.send(event).is_err(),
            None => {
                trace!(counter = %event.counter_name, "Counter event without listener");
                return;
            }
        };
        if closed {
            self.counter_listeners.remove(&listener_id);
        }
    }

    /// Notify and drop every listener pinned to a server whose connection closed
    pub fn failover_listeners(&self, address: &ServerAddress) -> usize {
        let affected: Vec<Bytes> = self
            .listeners
            .iter()
            .filter(|entry| entry.started && entry.address.as_ref() == Some(address))
            .map(|entry| entry.key().clone())
            .collect();

        for listener_id in &affected {
            if let Some((_, registration)) = self.listeners.remove(listener_id) {
                debug!(
                    listener_id = %hex::encode(listener_id),
                    cache = %registration.cache_name,
                    address = %address,
                    "Failing over client listener"
                );
                let _ = registration.sender.send(ClientEvent::Failover);
            }
        }
        affected.len()
    }
}
