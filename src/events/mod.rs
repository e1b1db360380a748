//! Cluster topology notifications.
//!
//! [`ClusterEventBus`] decouples the partition service from whoever reacts to
//! topology changes. Consumers either register a [`ClusterEventListener`],
//! which is invoked synchronously from inside `recalculate`, or subscribe to
//! the broadcast channel and process events on their own tasks.
//!
//! Listeners must not block: they should hand work off to their own queues.


use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::constants::CLUSTER_EVENT_CHANNEL_CAPACITY;
use crate::InstanceIdentity;
use crate::QueueKey;

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    ServerAdded(InstanceIdentity),
    /// Same address, different roles or tenant
    ServerUpdated(InstanceIdentity),
    ServerRemoved(InstanceIdentity),
    /// Full ownership list of the local instance for `queue_key`
    PartitionsChanged {
        queue_key: QueueKey,
        partitions: Vec<u32>,
    },
}

#[cfg_attr(test, automock)]
pub trait ClusterEventListener: Send + Sync + 'static {
    fn on_server_added(
        &self,
        _identity: &InstanceIdentity,
    ) {
    }

    fn on_server_updated(
        &self,
        _identity: &InstanceIdentity,
    ) {
    }

    fn on_server_removed(
        &self,
        _identity: &InstanceIdentity,
    ) {
    }

    fn on_partitions_changed(
        &self,
        _queue_key: &QueueKey,
        _partitions: &[u32],
    ) {
    }
}

pub struct ClusterEventBus {
    tx: broadcast::Sender<ClusterEvent>,
    listeners: RwLock<Vec<Arc<dyn ClusterEventListener>>>,
}

impl ClusterEventBus {
    pub fn new() -> Self {
        Self::with_capacity(CLUSTER_EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        listener: Arc<dyn ClusterEventListener>,
    ) {
        self.listeners.write().push(listener);
    }

    /// Receivers only see events published after they subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<ClusterEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn publish(
        &self,
        event: ClusterEvent,
    ) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            match &event {
                ClusterEvent::ServerAdded(identity) => listener.on_server_added(identity),
                ClusterEvent::ServerUpdated(identity) => listener.on_server_updated(identity),
                ClusterEvent::ServerRemoved(identity) => listener.on_server_removed(identity),
                ClusterEvent::PartitionsChanged {
                    queue_key,
                    partitions,
                } => listener.on_partitions_changed(queue_key, partitions),
            }
        }

        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            trace!("cluster event dropped: no subscribers");
        }
    }
}

impl Default for ClusterEventBus {
    fn default() -> Self {
        Self::new()
    }
}
