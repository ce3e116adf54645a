//! Typed entry point for one named cache

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatcher::OperationDispatcher;
use crate::error::HotRodResult;
use crate::event::ClientEvent;
use crate::operations::{
    AddClientListenerOperation, ClearOperation, ConditionalOutcome, ContainsKeyOperation, FactoryReference,
    GetOperation, PingOperation, PingResponse, PutIfAbsentOperation, PutOperation, RemoveOperation, ReplaceOperation,
    SizeOperation,
};
use crate::utils::generate_listener_id;

/// Options for a client listener registration
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Receive a created event for every existing entry first
    pub include_current_state: bool,
    pub filter_factory: Option<FactoryReference>,
    pub converter_factory: Option<FactoryReference>,
    pub use_raw_data: bool,
}

/// A registered client listener
#[derive(Debug)]
pub struct ClientListener {
    pub id: Bytes,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Handle to a remote cache; cheap to clone
#[derive(Clone)]
pub struct RemoteCache {
    name: String,
    dispatcher: Arc<OperationDispatcher>,
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache").field("name", &self.name).finish()
    }
}

impl RemoteCache {
    pub(crate) fn new(name: String, dispatcher: Arc<OperationDispatcher>) -> Self {
        Self { name, dispatcher }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn ping(&self) -> HotRodResult<PingResponse> {
        self.dispatcher.execute(PingOperation::new(self.name.as_str())).await
    }

    pub async fn get<K: Into<Bytes>>(&self, key: K) -> HotRodResult<Option<Bytes>> {
        self.dispatcher.execute(GetOperation::new(self.name.as_str(), key)).await
    }

    /// Store `value`; returns the previous value when `return_previous` is set
    pub async fn put<K: Into<Bytes>, V: Into<Bytes>>(
        &self,
        key: K,
        value: V,
        return_previous: bool,
    ) -> HotRodResult<Option<Bytes>> {
        let operation = PutOperation::new(self.name.as_str(), key, value).return_previous(return_previous);
        self.dispatcher.execute(operation).await
    }

    pub async fn put_with_expiration<K: Into<Bytes>, V: Into<Bytes>>(
        &self,
        key: K,
        value: V,
        lifespan: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> HotRodResult<()> {
        let operation = PutOperation::new(self.name.as_str(), key, value).with_expiration(lifespan, max_idle);
        self.dispatcher.execute(operation).await.map(|_| ())
    }

    pub async fn put_if_absent<K: Into<Bytes>, V: Into<Bytes>>(&self, key: K, value: V) -> HotRodResult<ConditionalOutcome> {
        let operation = PutIfAbsentOperation::new(self.name.as_str(), key, value).return_previous(true);
        self.dispatcher.execute(operation).await
    }

    pub async fn replace<K: Into<Bytes>, V: Into<Bytes>>(&self, key: K, value: V) -> HotRodResult<ConditionalOutcome> {
        let operation = ReplaceOperation::new(self.name.as_str(), key, value).return_previous(true);
        self.dispatcher.execute(operation).await
    }

    pub async fn remove<K: Into<Bytes>>(&self, key: K) -> HotRodResult<ConditionalOutcome> {
        let operation = RemoveOperation::new(self.name.as_str(), key).return_previous(true);
        self.dispatcher.execute(operation).await
    }

    pub async fn contains_key<K: Into<Bytes>>(&self, key: K) -> HotRodResult<bool> {
        self.dispatcher.execute(ContainsKeyOperation::new(self.name.as_str(), key)).await
    }

    pub async fn clear(&self) -> HotRodResult<()> {
        self.dispatcher.execute(ClearOperation::new(self.name.as_str())).await
    }

    pub async fn size(&self) -> HotRodResult<u64> {
        self.dispatcher.execute(SizeOperation::new(self.name.as_str())).await
    }

    /// Register a client listener. Events arrive on the returned receiver
    /// until the listener is removed or a [`ClientEvent::Failover`] is
    /// delivered.
    pub async fn add_client_listener(&self, options: ListenerOptions) -> HotRodResult<ClientListener> {
        let id = generate_listener_id();
        let mut operation = AddClientListenerOperation::new(self.name.as_str(), id.clone())
            .include_current_state(options.include_current_state)
            .use_raw_data(options.use_raw_data);
        if let Some(filter) = options.filter_factory {
            operation = operation.filter_factory(filter);
        }
        if let Some(converter) = options.converter_factory {
            operation = operation.converter_factory(converter);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let address = self.dispatcher.add_client_listener(operation, tx).await?;
        debug!(cache = %self.name, address = %address, "Listener pinned");
        Ok(ClientListener { id, events: rx })
    }

    pub async fn remove_client_listener(&self, listener_id: &[u8]) -> HotRodResult<bool> {
        self.dispatcher.remove_client_listener(&self.name, listener_id).await
    }
}
