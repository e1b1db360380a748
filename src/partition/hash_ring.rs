use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::HashFunction;
use crate::InstanceIdentity;
use crate::ServiceAddress;

/// Consistent-hash ring of one queue key.
///
/// Each member occupies `virtual_nodes` positions. The owner of a position
/// is the first member at or after it walking clockwise, wrapping to the
/// smallest position.
#[derive(Debug, Clone)]
pub struct HashRing {
    hash_function: HashFunction,
    virtual_nodes: u32,
    positions: BTreeMap<u64, Arc<InstanceIdentity>>,
    members: BTreeMap<ServiceAddress, Arc<InstanceIdentity>>,
}

impl HashRing {
    pub fn new(
        hash_function: HashFunction,
        virtual_nodes: u32,
    ) -> Self {
        Self {
            hash_function,
            virtual_nodes,
            positions: BTreeMap::new(),
            members: BTreeMap::new(),
        }
    }

    pub fn build<I>(
        hash_function: HashFunction,
        virtual_nodes: u32,
        members: I,
    ) -> Self
    where
        I: IntoIterator<Item = Arc<InstanceIdentity>>,
    {
        let mut ring = Self::new(hash_function, virtual_nodes);
        for identity in members {
            ring.add_instance(identity);
        }
        ring
    }

    /// Colliding positions go to the smaller address so every instance
    /// resolves the same owner regardless of insertion order.
    pub fn add_instance(
        &mut self,
        identity: Arc<InstanceIdentity>,
    ) {
        for index in 0..self.virtual_nodes {
            let position = self.hash_function.hash_virtual_node(identity.address(), index);
            match self.positions.entry(position) {
                Entry::Vacant(slot) => {
                    slot.insert(identity.clone());
                }
                Entry::Occupied(mut slot) => {
                    if identity.address() <= slot.get().address() {
                        debug!(
                            "ring position {} collides: {} replaces {}",
                            position,
                            identity.address(),
                            slot.get().address()
                        );
                        slot.insert(identity.clone());
                    }
                }
            }
        }
        self.members.insert(identity.address().clone(), identity);
    }

    pub fn owner_of(
        &self,
        position: u64,
    ) -> Option<&Arc<InstanceIdentity>> {
        self.positions
            .range(position..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, identity)| identity)
    }

    pub fn partition_owner(
        &self,
        partition: u32,
    ) -> Option<&Arc<InstanceIdentity>> {
        self.owner_of(self.hash_function.hash_partition(partition))
    }

    /// Ascending list of the partitions in `0..partition_count` owned by `address`
    pub fn owned_partitions(
        &self,
        address: &ServiceAddress,
        partition_count: u32,
    ) -> Vec<u32> {
        (0..partition_count)
            .filter(|partition| {
                self.partition_owner(*partition)
                    .map_or(false, |owner| owner.address() == address)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn virtual_node_count(&self) -> usize {
        self.positions.len()
    }

    /// Members ordered by address
    pub fn members(&self) -> impl Iterator<Item = &Arc<InstanceIdentity>> {
        self.members.values()
    }
}
