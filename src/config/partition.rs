use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::constants::DEFAULT_CORE_TOPIC;
use crate::constants::DEFAULT_PARTITIONS;
use crate::constants::DEFAULT_RULE_ENGINE_TOPIC;
use crate::constants::DEFAULT_VIRTUAL_NODES;
use crate::HashFunction;
use crate::Result;
use crate::ServiceRole;

/// Ring and partition layout.
///
/// Must be identical on every instance: a mismatch cannot be detected at
/// runtime and silently splits the fleet into incompatible rings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PartitionConfig {
    #[serde(default)]
    pub hash_function: HashFunction,

    /// Ring positions per instance
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    #[serde(default = "default_core")]
    pub core: RolePartitionConfig,

    #[serde(default = "default_rule_engine")]
    pub rule_engine: RolePartitionConfig,
}

/// Topic and partition count of one service role
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RolePartitionConfig {
    pub topic: String,
    pub partitions: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            hash_function: HashFunction::default(),
            virtual_nodes: default_virtual_nodes(),
            core: default_core(),
            rule_engine: default_rule_engine(),
        }
    }
}

impl PartitionConfig {
    pub fn role(
        &self,
        role: ServiceRole,
    ) -> &RolePartitionConfig {
        match role {
            ServiceRole::Core => &self.core,
            ServiceRole::RuleEngine => &self.rule_engine,
        }
    }

    pub fn partitions(
        &self,
        role: ServiceRole,
    ) -> u32 {
        self.role(role).partitions
    }

    pub fn validate(&self) -> Result<()> {
        if self.virtual_nodes == 0 {
            return Err(invalid("partitions.virtual_nodes must be > 0"));
        }

        if self.virtual_nodes > u32::MAX as usize {
            return Err(invalid("partitions.virtual_nodes exceeds u32::MAX"));
        }

        for role in ServiceRole::ALL {
            let table = self.role(role);
            if table.topic.trim().is_empty() {
                return Err(invalid(format!("partitions.{role}.topic cannot be empty")));
            }
            if table.partitions == 0 {
                return Err(invalid(format!("partitions.{role}.partitions must be > 0")));
            }
        }

        if self.core.topic == self.rule_engine.topic {
            return Err(invalid(format!(
                "core and rule_engine cannot share topic {}",
                self.core.topic
            )));
        }

        Ok(())
    }
}

fn default_virtual_nodes() -> usize {
    DEFAULT_VIRTUAL_NODES
}
fn default_core() -> RolePartitionConfig {
    RolePartitionConfig {
        topic: DEFAULT_CORE_TOPIC.to_string(),
        partitions: DEFAULT_PARTITIONS,
    }
}
fn default_rule_engine() -> RolePartitionConfig {
    RolePartitionConfig {
        topic: DEFAULT_RULE_ENGINE_TOPIC.to_string(),
        partitions: DEFAULT_PARTITIONS,
    }
}
