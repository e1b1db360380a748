//! Value types describing one running instance of the fleet.
//!
//! An [`InstanceIdentity`] is built once at process start and never mutated.
//! Two identities are the same instance when their network addresses match,
//! even if their role sets momentarily differ while a record update races
//! through the registry.


use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::utils::time::current_timestamp_ms;
use crate::DiscoveryError;
use crate::Result;
use crate::ServiceConfig;
use crate::SystemError;

/// A class of work an instance can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Core,
    RuleEngine,
}

impl ServiceRole {
    pub const ALL: [ServiceRole; 2] = [ServiceRole::Core, ServiceRole::RuleEngine];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Core => "core",
            ServiceRole::RuleEngine => "rule_engine",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl fmt::Display for TenantId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a device, asset or any other routed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<TenantId> for EntityId {
    fn from(tenant: TenantId) -> Self {
        EntityId(tenant.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable description of one running instance.
///
/// Equality, ordering and hashing only look at [`ServiceAddress`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceIdentity {
    service_id: String,
    address: ServiceAddress,
    roles: BTreeSet<ServiceRole>,
    tenant: Option<TenantId>,
    created_at: u64,
}

impl InstanceIdentity {
    pub fn new(
        service_id: impl Into<String>,
        address: ServiceAddress,
        roles: impl IntoIterator<Item = ServiceRole>,
        tenant: Option<TenantId>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            address,
            roles: roles.into_iter().collect(),
            tenant,
            created_at: current_timestamp_ms(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.service_id.clone(),
            ServiceAddress::new(config.host.clone(), config.port),
            config.roles.iter().copied(),
            config.tenant_id,
        )
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    pub fn roles(&self) -> &BTreeSet<ServiceRole> {
        &self.roles
    }

    pub fn serves(
        &self,
        role: ServiceRole,
    ) -> bool {
        self.roles.contains(&role)
    }

    /// Tenant this instance is dedicated to, if it is tenant-isolated
    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Same address but different advertised roles or tenant
    pub fn differs_in_content(
        &self,
        other: &InstanceIdentity,
    ) -> bool {
        self.service_id != other.service_id || self.roles != other.roles || self.tenant != other.tenant
    }

    /// Checks the fields a ring entry relies on.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.address.host.is_empty() {
            return Err("empty host".into());
        }
        if self.address.port == 0 {
            return Err("port 0".into());
        }
        if self.roles.is_empty() {
            return Err("no roles advertised".into());
        }
        Ok(())
    }
}

impl PartialEq for InstanceIdentity {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.address == other.address
    }
}

impl Eq for InstanceIdentity {}

impl Hash for InstanceIdentity {
    fn hash<H: Hasher>(
        &self,
        state: &mut H,
    ) {
        self.address.hash(state);
    }
}

impl PartialOrd for InstanceIdentity {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InstanceIdentity {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Display for InstanceIdentity {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}@{}", self.service_id, self.address)
    }
}

/// Payload codec of the membership records stored in the registry
pub struct MembershipRecord;

impl MembershipRecord {
    pub fn encode(identity: &InstanceIdentity) -> Result<Vec<u8>> {
        bincode::serialize(identity).map_err(|e| SystemError::BincodeError(e).into())
    }

    pub fn decode(
        path: &str,
        data: &[u8],
    ) -> Result<InstanceIdentity> {
        let identity: InstanceIdentity = bincode::deserialize(data).map_err(|e| DiscoveryError::MalformedRecord {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        identity.validate().map_err(|reason| DiscoveryError::MalformedRecord {
            path: path.to_string(),
            reason,
        })?;
        Ok(identity)
    }
}
