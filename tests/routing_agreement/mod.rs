use fleet_cluster::EntityId;
use fleet_cluster::PartitionService;
use fleet_cluster::ServiceRole;
use fleet_cluster::TenantId;
use uuid::Uuid;

use crate::common::eventually;
use crate::common::is_exact_cover;
use crate::common::node_config;
use crate::common::start_node;
use crate::common::PARTITIONS;
use crate::enable_logger;

fn random_entity() -> EntityId {
    EntityId(Uuid::from_u128(rand::random::<u128>()))
}

#[tokio::test]
async fn test_every_node_agrees_on_entity_owner() {
    enable_logger();
    let registry = "routing-agreement";
    let nodes = vec![
        start_node(node_config(registry, "svc-a", 8001, None)).await.unwrap(),
        start_node(node_config(registry, "svc-b", 8002, None)).await.unwrap(),
        start_node(node_config(registry, "svc-c", 8003, None)).await.unwrap(),
    ];
    eventually("all members known", || nodes.iter().all(|n| n.members() == 3)).await;
    assert!(is_exact_cover(&nodes.iter().collect::<Vec<_>>()));

    let tenant = TenantId(Uuid::from_u128(7));
    for _ in 0..200 {
        let entity = random_entity();
        let answers: Vec<_> = nodes
            .iter()
            .map(|n| {
                n.node
                    .partition_service()
                    .resolve(ServiceRole::Core, tenant, &entity)
                    .unwrap()
            })
            .collect();

        assert!(answers.iter().all(|info| info.partition == answers[0].partition));
        assert!(answers[0].partition < PARTITIONS);
        assert_eq!(answers.iter().filter(|info| info.is_my_partition()).count(), 1);
        assert!(answers.iter().all(|info| info.topic == "fleet.core" && info.tenant.is_none()));
    }
}

#[tokio::test]
async fn test_isolated_tenant_routes_to_dedicated_instance() {
    enable_logger();
    let registry = "routing-isolation";
    let dedicated = TenantId(Uuid::from_u128(42));
    let other = TenantId(Uuid::from_u128(43));

    let a = start_node(node_config(registry, "svc-a", 8101, None)).await.unwrap();
    let b = start_node(node_config(registry, "svc-b", 8102, None)).await.unwrap();
    let c = start_node(node_config(registry, "svc-c", 8103, Some(dedicated))).await.unwrap();

    eventually("isolation known to shared instances", || {
        [&a, &b].iter().all(|n| {
            n.members() == 3 && n.node.partition_service().is_isolated(ServiceRole::Core, dedicated)
        }) && c.members() == 3
    })
    .await;

    // The dedicated instance owns its private ring; the shared ring is split without it
    assert_eq!(c.owned(), (0..PARTITIONS).collect::<Vec<u32>>());
    assert!(is_exact_cover(&[&a, &b]));
    assert!(!a.node.partition_service().is_isolated(ServiceRole::Core, other));
    assert!(!a.node.partition_service().is_isolated(ServiceRole::RuleEngine, dedicated));

    let entity = random_entity();
    let from_a = a.node.partition_service().resolve(ServiceRole::Core, dedicated, &entity).unwrap();
    let from_b = b.node.partition_service().resolve(ServiceRole::Core, dedicated, &entity).unwrap();
    let from_c = c.node.partition_service().resolve(ServiceRole::Core, dedicated, &entity).unwrap();
    assert_eq!(from_a.tenant, Some(dedicated));
    assert_eq!(from_a.partition, from_c.partition);
    assert!(!from_a.is_my_partition() && !from_b.is_my_partition());
    assert!(from_c.is_my_partition());
    assert_eq!(
        from_c.full_topic_name(),
        format!("fleet.core.{}.{}", dedicated, from_c.partition)
    );

    let shared = c.node.partition_service().resolve(ServiceRole::Core, other, &entity).unwrap();
    assert!(shared.tenant.is_none());
    assert!(!shared.is_my_partition());
}
