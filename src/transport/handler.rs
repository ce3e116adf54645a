//! One operation channel per server address

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::activation::ActivationStep;
use super::channel::OperationChannel;
use super::connection::Connector;
use super::{PoolSettings, TransportEvents, TransportSettings};
use crate::core::ServerAddress;
use crate::metrics::MetricsRegistry;
use crate::operations::QueuedOperation;

pub(crate) struct ChannelHandler {
    channels: DashMap<ServerAddress, Arc<OperationChannel>>,
    connector: Arc<Connector>,
    pool_settings: PoolSettings,
    metrics: Arc<dyn MetricsRegistry>,
    events: Weak<dyn TransportEvents>,
}

impl ChannelHandler {
    pub fn new(
        settings: TransportSettings,
        pool_settings: PoolSettings,
        activation: Vec<Arc<dyn ActivationStep>>,
        metrics: Arc<dyn MetricsRegistry>,
        events: Weak<dyn TransportEvents>,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            connector: Arc::new(Connector::new(settings, events.clone(), activation)),
            pool_settings,
            metrics,
            events,
        }
    }

    pub fn get_channel(&self, address: &ServerAddress) -> Option<Arc<OperationChannel>> {
        self.channels.get(address).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_or_create_channel(&self, address: &ServerAddress) -> Arc<OperationChannel> {
        self.create_if_missing(address).0
    }

    fn create_if_missing(&self, address: &ServerAddress) -> (Arc<OperationChannel>, bool) {
        if let Some(channel) = self.get_channel(address) {
            return (channel, false);
        }
        let mut created = false;
        let channel = self
            .channels
            .entry(address.clone())
            .or_insert_with(|| {
                created = true;
                debug!(address = %address, "Creating operation channel");
                OperationChannel::new(
                    address.clone(),
                    Arc::clone(&self.connector),
                    self.pool_settings.clone(),
                    Arc::clone(&self.metrics),
                    self.events.clone(),
                )
            })
            .value()
            .clone();
        (channel, created)
    }

    /// Create the channel for a newly seen server and open its first
    /// connection in the background
    pub fn start_channel_if_needed(&self, address: &ServerAddress) -> Arc<OperationChannel> {
        let (channel, created) = self.create_if_missing(address);
        if created {
            let connecting = Arc::clone(&channel);
            tokio::spawn(async move {
                if let Err(e) = connecting.connect().await {
                    debug!(address = %connecting.address(), error = %e, "Initial connect failed");
                }
            });
        }
        channel
    }

    pub fn submit(&self, address: &ServerAddress, operation: QueuedOperation) {
        self.get_or_create_channel(address).send_operation(operation);
    }

    /// Drop the channel for a server that left the cluster, returning the
    /// operations that never reached it
    pub fn remove_channel(&self, address: &ServerAddress, graceful: bool) -> Vec<QueuedOperation> {
        match self.channels.remove(address) {
            Some((_, channel)) => {
                info!(address = %address, graceful, "Closing channel to removed server");
                if graceful {
                    channel.close_gracefully()
                } else {
                    channel.close()
                }
            }
            None => Vec::new(),
        }
    }

    pub fn addresses(&self) -> Vec<ServerAddress> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn close_all(&self) -> Vec<QueuedOperation> {
        let addresses = self.addresses();
        let mut queued = Vec::new();
        for address in addresses {
            if let Some((_, channel)) = self.channels.remove(&address) {
                queued.extend(channel.close());
            }
        }
        queued
    }
}
