// -
// Registry layout

/// Parent directory holding one ephemeral record per live instance
pub(crate) const DEFAULT_REGISTRY_PATH: &str = "/fleet/nodes";

/// Name prefix of the ephemeral-sequential membership records
pub(crate) const MEMBERSHIP_NODE_PREFIX: &str = "node-";

/// Width of the zero-padded sequence suffix appended by the registry
pub(crate) const SEQUENCE_SUFFIX_WIDTH: usize = 10;

// -
// Partitioning

pub(crate) const DEFAULT_VIRTUAL_NODES: usize = 16;
pub(crate) const DEFAULT_PARTITIONS: u32 = 10;

pub(crate) const DEFAULT_CORE_TOPIC: &str = "fleet.core";
pub(crate) const DEFAULT_RULE_ENGINE_TOPIC: &str = "fleet.rule-engine";

/// Infix of the per-instance notification topic
pub(crate) const NOTIFICATIONS_TOPIC_INFIX: &str = "notifications";

// -
// Events

/// Capacity of the cluster event broadcast channel
pub(crate) const CLUSTER_EVENT_CHANNEL_CAPACITY: usize = 1024;
