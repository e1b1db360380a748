//! Consistent-hash partition routing.
//!
//! Entity to partition mapping depends only on the hash function and the
//! configured partition count. Ring membership decides which instance owns a
//! partition, so a membership change moves ownership without renumbering any
//! entity.

mod hash_partition_service;
mod hash_ring;
mod queue;

pub use hash_partition_service::*;
pub use hash_ring::*;
pub use queue::*;


use std::sync::Arc;

use tokio::sync::broadcast;

use crate::ClusterEvent;
use crate::EntityId;
use crate::InstanceIdentity;
use crate::Result;
use crate::ServiceRole;
use crate::TenantId;

pub trait PartitionService: Send + Sync + 'static {
    /// Maps an entity to its topic partition.
    ///
    /// # Errors
    /// `RoutingError::NoOwnerAvailable` when no live instance serves the ring
    /// the entity routes through.
    fn resolve(
        &self,
        role: ServiceRole,
        tenant: TenantId,
        entity_id: &EntityId,
    ) -> Result<TopicPartitionInfo>;

    /// Partitions the local instance owns in its own scope for `role`
    fn owned_partitions(
        &self,
        role: ServiceRole,
    ) -> Vec<u32>;

    fn owned_partitions_for(
        &self,
        queue_key: &QueueKey,
    ) -> Vec<u32>;

    /// Rebuilds every ring from the full membership snapshot.
    fn recalculate(
        &self,
        current: &InstanceIdentity,
        others: &[InstanceIdentity],
    );

    fn self_identity(&self) -> Arc<InstanceIdentity>;

    /// Service ids of all live instances serving `role`, including this one
    fn all_service_ids(
        &self,
        role: ServiceRole,
    ) -> Vec<String>;

    /// Topic an individual instance receives direct notifications on
    fn notifications_topic(
        &self,
        role: ServiceRole,
        service_id: &str,
    ) -> String;

    fn is_isolated(
        &self,
        role: ServiceRole,
        tenant: TenantId,
    ) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}
