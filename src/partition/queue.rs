use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::ServiceRole;
use crate::TenantId;

/// Identifies one hash ring: a role, shared or dedicated to a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub role: ServiceRole,
    /// `None` for the shared ring
    pub tenant: Option<TenantId>,
}

impl QueueKey {
    pub fn shared(role: ServiceRole) -> Self {
        Self { role, tenant: None }
    }

    pub fn isolated(
        role: ServiceRole,
        tenant: TenantId,
    ) -> Self {
        Self {
            role,
            tenant: Some(tenant),
        }
    }

    /// Metric label of the tenant scope
    pub fn scope(&self) -> String {
        match self.tenant {
            Some(tenant) => tenant.to_string(),
            None => "shared".to_string(),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.tenant {
            Some(tenant) => write!(f, "{}[{}]", self.role, tenant),
            None => write!(f, "{}", self.role),
        }
    }
}

/// Outcome of routing one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPartitionInfo {
    pub topic: String,
    /// Set only when the tenant is isolated for the role
    pub tenant: Option<TenantId>,
    pub partition: u32,
    /// Whether the local instance owns `partition`
    pub my_partition: bool,
}

impl TopicPartitionInfo {
    pub fn is_my_partition(&self) -> bool {
        self.my_partition
    }

    /// `topic[.tenant].partition`
    pub fn full_topic_name(&self) -> String {
        match self.tenant {
            Some(tenant) => format!("{}.{}.{}", self.topic, tenant, self.partition),
            None => format!("{}.{}", self.topic, self.partition),
        }
    }
}

impl fmt::Display for TopicPartitionInfo {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.full_topic_name())
    }
}

/// Roles each tenant has dedicated instances for.
///
/// Derived from membership on every recalculation, never configured.
// TODO: load isolated tenants from persistent tenant configuration instead of
// inferring them from which peers advertise a tenant id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantIsolationTable {
    tenants: BTreeMap<TenantId, BTreeSet<ServiceRole>>,
}

impl TenantIsolationTable {
    pub fn register<'a>(
        &mut self,
        tenant: TenantId,
        roles: impl IntoIterator<Item = &'a ServiceRole>,
    ) {
        self.tenants.entry(tenant).or_default().extend(roles);
    }

    pub fn is_isolated(
        &self,
        role: ServiceRole,
        tenant: TenantId,
    ) -> bool {
        self.tenants.get(&tenant).map_or(false, |roles| roles.contains(&role))
    }

    /// Ring a `(role, tenant)` pair routes through
    pub fn queue_key(
        &self,
        role: ServiceRole,
        tenant: TenantId,
    ) -> QueueKey {
        if self.is_isolated(role, tenant) {
            QueueKey::isolated(role, tenant)
        } else {
            QueueKey::shared(role)
        }
    }

    pub fn tenants(&self) -> impl Iterator<Item = &TenantId> {
        self.tenants.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
