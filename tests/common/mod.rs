use std::sync::Arc;
use std::time::Duration;

use fleet_cluster::ClusterNode;
use fleet_cluster::ClusterNodeBuilder;
use fleet_cluster::ClusterNodeConfig;
use fleet_cluster::DiscoveryBackend;
use fleet_cluster::PartitionService;
use fleet_cluster::Result;
use fleet_cluster::ServiceRole;
use fleet_cluster::TenantId;
use tokio::sync::watch;
use tokio::time::sleep;

pub const WAIT_ATTEMPTS: usize = 500;
pub const WAIT_STEP_MS: u64 = 10;

pub const PARTITIONS: u32 = 10;

/// A started node and the sender that stops it
pub struct TestNode {
    pub node: Arc<ClusterNode>,
    pub shutdown_tx: watch::Sender<()>,
}

impl TestNode {
    pub fn owned(&self) -> Vec<u32> {
        self.node.partition_service().owned_partitions(ServiceRole::Core)
    }

    pub fn members(&self) -> usize {
        self.node.partition_service().all_service_ids(ServiceRole::Core).len()
    }
}

pub fn node_config(
    registry: &str,
    service_id: &str,
    port: u16,
    tenant: Option<TenantId>,
) -> ClusterNodeConfig {
    let mut config = ClusterNodeConfig::default();
    config.service.service_id = service_id.to_string();
    config.service.port = port;
    config.service.roles = vec![ServiceRole::Core];
    config.service.tenant_id = tenant;
    config.discovery.backend = DiscoveryBackend::Registry;
    config.discovery.url = format!("embedded://{registry}");
    config.discovery.retry_interval_ms = 50;
    config.monitoring.prometheus_enabled = false;
    config
}

pub async fn start_node(config: ClusterNodeConfig) -> Result<TestNode> {
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let node = ClusterNodeBuilder::from_config(config, shutdown_rx).build()?.ready()?;
    node.start().await?;
    Ok(TestNode { node, shutdown_tx })
}

pub async fn eventually<F: Fn() -> bool>(
    what: &str,
    condition: F,
) {
    for _ in 0..WAIT_ATTEMPTS {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(WAIT_STEP_MS)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Every partition owned by exactly one of `nodes`
pub fn is_exact_cover(nodes: &[&TestNode]) -> bool {
    let mut all: Vec<u32> = nodes.iter().flat_map(|n| n.owned()).collect();
    all.sort_unstable();
    all == (0..PARTITIONS).collect::<Vec<u32>>()
}
