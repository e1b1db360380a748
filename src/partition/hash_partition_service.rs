//! Ring-backed [`PartitionService`].
//!
//! All routing state lives in one immutable [`RoutingSnapshot`] published
//! through an `ArcSwap`. Readers load the current snapshot without locking;
//! `recalculate` builds a complete replacement off to the side, swaps it in,
//! and then emits notifications while still holding the rebuild lock so that
//! consumers observe rebuilds in the order they happened.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use arc_swap::ArcSwap;
use autometrics::autometrics;
use config::ConfigError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::HashRing;
use super::PartitionService;
use super::QueueKey;
use super::TenantIsolationTable;
use super::TopicPartitionInfo;
use crate::constants::NOTIFICATIONS_TOPIC_INFIX;
use crate::metrics::MEMBERSHIP_EVENTS_METRIC;
use crate::metrics::OWNED_PARTITIONS_METRIC;
use crate::metrics::RECALCULATIONS_METRIC;
use crate::metrics::RING_MEMBERS_METRIC;
use crate::ClusterEvent;
use crate::ClusterEventBus;
use crate::ClusterEventListener;
use crate::EntityId;
use crate::Error;
use crate::InstanceIdentity;
use crate::PartitionConfig;
use crate::Result;
use crate::RoutingError;
use crate::ServiceAddress;
use crate::ServiceRole;
use crate::TenantId;
use crate::API_SLO;

/// One consistent view of the cluster
#[derive(Debug)]
struct RoutingSnapshot {
    local: Arc<InstanceIdentity>,
    rings: HashMap<QueueKey, HashRing>,
    isolation: TenantIsolationTable,
    owned: BTreeMap<QueueKey, Vec<u32>>,
    /// Every accepted identity, local one included
    members: BTreeMap<ServiceAddress, Arc<InstanceIdentity>>,
}

impl RoutingSnapshot {
    fn empty(local: Arc<InstanceIdentity>) -> Self {
        Self {
            local,
            rings: HashMap::new(),
            isolation: TenantIsolationTable::default(),
            owned: BTreeMap::new(),
            members: BTreeMap::new(),
        }
    }
}

pub struct HashPartitionService {
    config: PartitionConfig,
    snapshot: ArcSwap<RoutingSnapshot>,
    rebuild_lock: Mutex<()>,
    events: ClusterEventBus,
}

impl Debug for HashPartitionService {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HashPartitionService")
            .field("local", &self.snapshot.load().local.to_string())
            .field("hash_function", &self.config.hash_function)
            .field("virtual_nodes", &self.config.virtual_nodes)
            .finish()
    }
}

impl HashPartitionService {
    /// Starts with empty rings: nothing resolves until the first
    /// `recalculate`.
    pub fn new(
        config: PartitionConfig,
        local: InstanceIdentity,
    ) -> Self {
        Self {
            config,
            snapshot: ArcSwap::from_pointee(RoutingSnapshot::empty(Arc::new(local))),
            rebuild_lock: Mutex::new(()),
            events: ClusterEventBus::new(),
        }
    }

    pub fn events(&self) -> &ClusterEventBus {
        &self.events
    }

    pub fn register_listener(
        &self,
        listener: Arc<dyn ClusterEventListener>,
    ) {
        self.events.register(listener);
    }

    /// Owner of `partition` in the ring of `queue_key`
    pub fn partition_owner(
        &self,
        queue_key: &QueueKey,
        partition: u32,
    ) -> Option<Arc<InstanceIdentity>> {
        self.snapshot
            .load()
            .rings
            .get(queue_key)
            .and_then(|ring| ring.partition_owner(partition))
            .cloned()
    }

    /// Accepted members keyed by address. Peers carrying the local address are
    /// dropped and invalid peers skipped; a later duplicate address wins.
    fn collect_members(
        local: &Arc<InstanceIdentity>,
        others: &[InstanceIdentity],
    ) -> BTreeMap<ServiceAddress, Arc<InstanceIdentity>> {
        let mut members = BTreeMap::new();
        members.insert(local.address().clone(), local.clone());

        for peer in others {
            if peer.address() == local.address() {
                trace!("ignoring peer record carrying the local address: {}", peer);
                continue;
            }
            if let Err(reason) = peer.validate() {
                warn!("skipping malformed peer {}: {}", peer, reason);
                continue;
            }
            if members.insert(peer.address().clone(), Arc::new(peer.clone())).is_some() {
                debug!("duplicate record for {}, keeping the latest", peer.address());
            }
        }
        members
    }

    fn build_snapshot(
        &self,
        local: Arc<InstanceIdentity>,
        members: BTreeMap<ServiceAddress, Arc<InstanceIdentity>>,
    ) -> RoutingSnapshot {
        // validated to fit at startup
        let virtual_nodes = u32::try_from(self.config.virtual_nodes).unwrap_or(u32::MAX);
        let mut isolation = TenantIsolationTable::default();
        let mut ring_members: HashMap<QueueKey, Vec<Arc<InstanceIdentity>>> = HashMap::new();

        for identity in members.values() {
            if let Some(tenant) = identity.tenant() {
                isolation.register(tenant, identity.roles());
            }
            for role in identity.roles() {
                let key = QueueKey {
                    role: *role,
                    tenant: identity.tenant(),
                };
                ring_members.entry(key).or_default().push(identity.clone());
            }
        }

        let rings: HashMap<QueueKey, HashRing> = ring_members
            .into_iter()
            .map(|(key, identities)| {
                let ring = HashRing::build(self.config.hash_function, virtual_nodes, identities);
                (key, ring)
            })
            .collect();

        let mut owned = BTreeMap::new();
        for role in local.roles() {
            let key = QueueKey {
                role: *role,
                tenant: local.tenant(),
            };
            let partitions = rings
                .get(&key)
                .map(|ring| ring.owned_partitions(local.address(), self.config.partitions(*role)))
                .unwrap_or_default();
            owned.insert(key, partitions);
        }

        RoutingSnapshot {
            local,
            rings,
            isolation,
            owned,
            members,
        }
    }

    fn publish_membership_diff(
        &self,
        previous: &RoutingSnapshot,
        current: &RoutingSnapshot,
    ) {
        let local = current.local.address();

        for (address, identity) in &current.members {
            if address == local {
                continue;
            }
            match previous.members.get(address) {
                None => {
                    info!("server added: {}", identity);
                    MEMBERSHIP_EVENTS_METRIC.with_label_values(&["added"]).inc();
                    self.events.publish(ClusterEvent::ServerAdded(identity.as_ref().clone()));
                }
                Some(old) if old.differs_in_content(identity) => {
                    info!("server updated: {}", identity);
                    MEMBERSHIP_EVENTS_METRIC.with_label_values(&["updated"]).inc();
                    self.events.publish(ClusterEvent::ServerUpdated(identity.as_ref().clone()));
                }
                Some(_) => {}
            }
        }

        for (address, identity) in &previous.members {
            if address != local && !current.members.contains_key(address) {
                info!("server removed: {}", identity);
                MEMBERSHIP_EVENTS_METRIC.with_label_values(&["removed"]).inc();
                self.events.publish(ClusterEvent::ServerRemoved(identity.as_ref().clone()));
            }
        }
    }

    fn publish_ownership(
        &self,
        previous: &RoutingSnapshot,
        current: &RoutingSnapshot,
    ) {
        for (key, partitions) in &current.owned {
            let before: BTreeSet<u32> = previous
                .owned
                .get(key)
                .map(|p| p.iter().copied().collect())
                .unwrap_or_default();
            let after: BTreeSet<u32> = partitions.iter().copied().collect();
            if before != after {
                let gained: Vec<u32> = after.difference(&before).copied().collect();
                let lost: Vec<u32> = before.difference(&after).copied().collect();
                info!(
                    "[{}] owned partitions changed: gained {:?}, lost {:?}, now {} of {}",
                    key,
                    gained,
                    lost,
                    partitions.len(),
                    self.config.partitions(key.role)
                );
            }

            OWNED_PARTITIONS_METRIC
                .with_label_values(&[key.role.as_str(), &key.scope()])
                .set(partitions.len() as i64);

            self.events.publish(ClusterEvent::PartitionsChanged {
                queue_key: *key,
                partitions: partitions.clone(),
            });
        }
    }

    fn record_ring_sizes(
        previous: &RoutingSnapshot,
        current: &RoutingSnapshot,
    ) {
        for (key, ring) in &current.rings {
            RING_MEMBERS_METRIC
                .with_label_values(&[key.role.as_str(), &key.scope()])
                .set(ring.member_count() as i64);
        }
        for key in previous.rings.keys() {
            if !current.rings.contains_key(key) {
                RING_MEMBERS_METRIC
                    .with_label_values(&[key.role.as_str(), &key.scope()])
                    .set(0);
            }
        }
    }
}

impl PartitionService for HashPartitionService {
    #[autometrics(objective = API_SLO)]
    fn resolve(
        &self,
        role: ServiceRole,
        tenant: TenantId,
        entity_id: &EntityId,
    ) -> Result<TopicPartitionInfo> {
        let snapshot = self.snapshot.load();
        let queue_key = snapshot.isolation.queue_key(role, tenant);

        let ring_is_empty = snapshot.rings.get(&queue_key).map_or(true, |ring| ring.is_empty());
        if ring_is_empty {
            return Err(RoutingError::NoOwnerAvailable {
                role,
                tenant: queue_key.tenant,
            }
            .into());
        }

        let table = self.config.role(role);
        let partition = self
            .config
            .hash_function
            .hash_entity(entity_id)
            .checked_rem(u64::from(table.partitions))
            .ok_or_else(|| {
                Error::Config(ConfigError::Message(format!(
                    "partitions.{role}.partitions must be > 0"
                )))
            })? as u32;
        let my_partition = snapshot
            .owned
            .get(&queue_key)
            .map_or(false, |owned| owned.binary_search(&partition).is_ok());

        Ok(TopicPartitionInfo {
            topic: table.topic.clone(),
            tenant: queue_key.tenant,
            partition,
            my_partition,
        })
    }

    fn owned_partitions(
        &self,
        role: ServiceRole,
    ) -> Vec<u32> {
        let snapshot = self.snapshot.load();
        let key = QueueKey {
            role,
            tenant: snapshot.local.tenant(),
        };
        snapshot.owned.get(&key).cloned().unwrap_or_default()
    }

    fn owned_partitions_for(
        &self,
        queue_key: &QueueKey,
    ) -> Vec<u32> {
        self.snapshot.load().owned.get(queue_key).cloned().unwrap_or_default()
    }

    #[autometrics(objective = API_SLO)]
    fn recalculate(
        &self,
        current: &InstanceIdentity,
        others: &[InstanceIdentity],
    ) {
        let _guard = self.rebuild_lock.lock();

        let previous = self.snapshot.load_full();
        if previous.local.address() != current.address() {
            warn!(
                "local identity changed from {} to {}",
                previous.local, current
            );
        }

        let local = Arc::new(current.clone());
        let members = Self::collect_members(&local, others);
        let snapshot = Arc::new(self.build_snapshot(local, members));
        self.snapshot.store(snapshot.clone());

        debug!(
            "recalculated {} ring(s) over {} member(s)",
            snapshot.rings.len(),
            snapshot.members.len()
        );
        RECALCULATIONS_METRIC.inc();
        Self::record_ring_sizes(&previous, &snapshot);

        self.publish_membership_diff(&previous, &snapshot);
        self.publish_ownership(&previous, &snapshot);
    }

    fn self_identity(&self) -> Arc<InstanceIdentity> {
        self.snapshot.load().local.clone()
    }

    fn all_service_ids(
        &self,
        role: ServiceRole,
    ) -> Vec<String> {
        let ids: BTreeSet<String> = self
            .snapshot
            .load()
            .members
            .values()
            .filter(|identity| identity.serves(role))
            .map(|identity| identity.service_id().to_string())
            .collect();
        ids.into_iter().collect()
    }

    fn notifications_topic(
        &self,
        role: ServiceRole,
        service_id: &str,
    ) -> String {
        format!(
            "{}.{}.{}",
            self.config.role(role).topic,
            NOTIFICATIONS_TOPIC_INFIX,
            service_id
        )
    }

    fn is_isolated(
        &self,
        role: ServiceRole,
        tenant: TenantId,
    ) -> bool {
        self.snapshot.load().isolation.is_isolated(role, tenant)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}
