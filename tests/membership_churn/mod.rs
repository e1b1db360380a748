use fleet_cluster::DiscoveryState;
use fleet_cluster::EmbeddedRegistry;

use crate::common::eventually;
use crate::common::is_exact_cover;
use crate::common::node_config;
use crate::common::start_node;
use crate::common::PARTITIONS;
use crate::enable_logger;

#[tokio::test]
async fn test_partitions_follow_joins_and_leaves() {
    enable_logger();
    let registry = "churn-join-leave";

    let a = start_node(node_config(registry, "svc-a", 7001, None)).await.unwrap();
    assert_eq!(a.owned(), (0..PARTITIONS).collect::<Vec<u32>>());

    let b = start_node(node_config(registry, "svc-b", 7002, None)).await.unwrap();
    let c = start_node(node_config(registry, "svc-c", 7003, None)).await.unwrap();

    eventually("three members everywhere", || {
        a.members() == 3 && b.members() == 3 && c.members() == 3
    })
    .await;
    assert!(is_exact_cover(&[&a, &b, &c]));

    let owned_by_a = a.owned();
    let owned_by_b = b.owned();
    c.node.shutdown().await;

    eventually("survivors cover every partition", || {
        a.members() == 2 && b.members() == 2 && is_exact_cover(&[&a, &b])
    })
    .await;
    // Survivors keep what they had and only pick up the leaver's share
    assert!(owned_by_a.iter().all(|p| a.owned().contains(p)));
    assert!(owned_by_b.iter().all(|p| b.owned().contains(p)));
}

#[tokio::test]
async fn test_expired_session_rejoins_with_single_record() {
    enable_logger();
    let registry_name = "churn-session-expiry";
    let registry = EmbeddedRegistry::named(registry_name);

    let a = start_node(node_config(registry_name, "svc-a", 7101, None)).await.unwrap();
    let session_of_a = registry.live_sessions()[0];
    let b = start_node(node_config(registry_name, "svc-b", 7102, None)).await.unwrap();
    eventually("both members", || a.members() == 2 && b.members() == 2).await;

    assert!(registry.expire_session(session_of_a));

    eventually("a republished", || {
        a.node.discovery_state() == DiscoveryState::Published
            && !registry.live_sessions().contains(&session_of_a)
            && registry.children("/fleet/nodes").len() == 2
    })
    .await;
    eventually("cover restored", || {
        a.members() == 2 && b.members() == 2 && is_exact_cover(&[&a, &b])
    })
    .await;
}

#[tokio::test]
async fn test_registry_outage_keeps_last_assignment() {
    enable_logger();
    let registry_name = "churn-outage";
    let registry = EmbeddedRegistry::named(registry_name);

    let a = start_node(node_config(registry_name, "svc-a", 7201, None)).await.unwrap();
    let session_of_a = registry.live_sessions()[0];
    let owned_before = a.owned();

    registry.set_available(false);
    registry.expire_session(session_of_a);
    eventually("a reconnecting", || a.node.discovery_state() == DiscoveryState::Reconnecting).await;
    assert_eq!(a.owned(), owned_before);

    registry.set_available(true);
    eventually("a published again", || a.node.discovery_state() == DiscoveryState::Published).await;
    assert_eq!(registry.children("/fleet/nodes").len(), 1);
    assert_eq!(a.owned(), (0..PARTITIONS).collect::<Vec<u32>>());
}
