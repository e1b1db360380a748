use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

use super::*;
use crate::DiscoveryBackend;
use crate::DiscoveryConfig;
use crate::DiscoveryError;
use crate::Error;
use crate::InstanceIdentity;
use crate::MembershipRecord;
use crate::ServiceAddress;
use crate::ServiceRole;

const DIR: &str = "/fleet/nodes";

fn config() -> DiscoveryConfig {
    DiscoveryConfig {
        backend: DiscoveryBackend::Registry,
        retry_interval_ms: 50,
        ..Default::default()
    }
}

fn identity(
    service_id: &str,
    port: u16,
) -> InstanceIdentity {
    InstanceIdentity::new(
        service_id,
        ServiceAddress::new("127.0.0.1", port),
        vec![ServiceRole::Core],
        None,
    )
}

fn discovery(
    registry: &EmbeddedRegistry,
    identity: InstanceIdentity,
) -> RegistryDiscoveryService {
    RegistryDiscoveryService::new(config(), identity, registry.connector())
}

/// Decodable records currently in the registry
fn records(registry: &EmbeddedRegistry) -> Vec<(String, InstanceIdentity)> {
    registry
        .children(DIR)
        .into_iter()
        .filter_map(|node| {
            MembershipRecord::decode(&node.path, &node.data)
                .ok()
                .map(|identity| (node.path, identity))
        })
        .collect()
}

fn records_for(
    registry: &EmbeddedRegistry,
    port: u16,
) -> usize {
    records(registry)
        .iter()
        .filter(|(_, identity)| identity.address().port == port)
        .count()
}

async fn eventually<F: Fn() -> bool>(
    what: &str,
    condition: F,
) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_start_publishes_exactly_one_record() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));

    a.start().await.unwrap();

    assert_eq!(a.state(), DiscoveryState::Published);
    assert_eq!(records_for(&registry, 9001), 1);
    assert!(a.self_path().unwrap().starts_with("/fleet/nodes/node-"));
    assert!(a.peers().is_empty());
}

#[tokio::test]
async fn test_publish_self_is_idempotent() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    a.start().await.unwrap();
    let path = a.self_path();

    a.publish_self().await.unwrap();
    a.publish_self().await.unwrap();

    assert_eq!(a.self_path(), path);
    assert_eq!(registry.children(DIR).len(), 1);
}

#[tokio::test]
async fn test_publish_before_start_is_not_connected() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));

    let err = a.publish_self().await.unwrap_err();

    assert!(matches!(err, Error::Discovery(DiscoveryError::NotConnected)));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_peers_see_each_other() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    let b = discovery(&registry, identity("svc-b", 9002));
    let snapshots: Arc<Mutex<Vec<Vec<InstanceIdentity>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    a.on_membership_change(Arc::new(move |peers: Vec<InstanceIdentity>| sink.lock().push(peers)));

    a.start().await.unwrap();
    b.start().await.unwrap();

    assert_eq!(b.peers(), vec![identity("svc-a", 9001)]);
    eventually("a to see b", || a.peers() == vec![identity("svc-b", 9002)]).await;
    let last = snapshots.lock().last().cloned().unwrap();
    assert_eq!(last, vec![identity("svc-b", 9002)]);
    assert!(snapshots.lock().iter().all(|peers| peers.iter().all(|p| p.address().port != 9001)));
}

#[tokio::test]
async fn test_self_churn_does_not_notify() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    a.start().await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    a.on_membership_change(Arc::new(move |_peers: Vec<InstanceIdentity>| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    a.unpublish_self().await;
    assert_eq!(a.state(), DiscoveryState::ConnectedUnpublished);
    a.publish_self().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(a.state(), DiscoveryState::Published);
    assert_eq!(records_for(&registry, 9001), 1);
}

#[tokio::test]
async fn test_peer_departure_is_reported() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    let b = discovery(&registry, identity("svc-b", 9002));
    a.start().await.unwrap();
    b.start().await.unwrap();
    eventually("a to see b", || a.peers().len() == 1).await;

    b.shutdown().await;

    eventually("a to forget b", || a.peers().is_empty()).await;
    assert_eq!(b.state(), DiscoveryState::Terminal);
    assert_eq!(records_for(&registry, 9002), 0);
}

#[tokio::test]
async fn test_session_expiry_reconnects_with_a_single_record() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    let b = discovery(&registry, identity("svc-b", 9002));
    a.start().await.unwrap();
    b.start().await.unwrap();
    let old_session = a.session_id().unwrap();

    assert!(registry.expire_session(old_session));

    eventually("a to republish", || {
        a.state() == DiscoveryState::Published && a.session_id() != Some(old_session)
    })
    .await;
    assert_eq!(records_for(&registry, 9001), 1);
    assert_eq!(registry.live_sessions().len(), 2);
    eventually("b to see a again", || b.peers().len() == 1).await;
    assert_eq!(a.peers(), vec![identity("svc-b", 9002)]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_retries_until_registry_returns() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    a.start().await.unwrap();

    registry.set_available(false);
    registry.expire_session(a.session_id().unwrap());

    eventually("reconnecting state", || a.state() == DiscoveryState::Reconnecting).await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(a.state(), DiscoveryState::Reconnecting);
    assert_eq!(records_for(&registry, 9001), 0);

    registry.set_available(true);

    eventually("a to republish", || a.state() == DiscoveryState::Published).await;
    assert_eq!(records_for(&registry, 9001), 1);
    assert_eq!(registry.live_sessions().len(), 1);
}

#[tokio::test]
async fn test_stale_self_record_is_replaced() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    a.start().await.unwrap();
    let old_path = a.self_path().unwrap();

    let stale = identity("svc-a", 9999);
    registry.put_data(&old_path, MembershipRecord::encode(&stale).unwrap());
    a.publish_self().await.unwrap();

    let new_path = a.self_path().unwrap();
    assert_ne!(new_path, old_path);
    assert_eq!(records_for(&registry, 9999), 0);
    assert_eq!(records_for(&registry, 9001), 1);
    assert_eq!(registry.children(DIR).len(), 1);
}

#[tokio::test]
async fn test_vanished_self_record_is_republished() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    a.start().await.unwrap();
    let old_path = a.self_path().unwrap();

    assert!(registry.remove(&old_path));

    eventually("a to republish", || {
        a.self_path().map_or(false, |path| path != old_path) && a.state() == DiscoveryState::Published
    })
    .await;
    assert_eq!(records_for(&registry, 9001), 1);
}

#[tokio::test]
async fn test_leftover_record_of_previous_run_is_purged() {
    let registry = EmbeddedRegistry::new();
    registry.put_data(
        "/fleet/nodes/node-leftover",
        MembershipRecord::encode(&identity("svc-a", 9001)).unwrap(),
    );
    let a = discovery(&registry, identity("svc-a", 9001));

    a.start().await.unwrap();

    assert!(a.peers().is_empty());
    let paths: Vec<String> = records(&registry).into_iter().map(|(path, _)| path).collect();
    assert_eq!(paths, vec![a.self_path().unwrap()]);
}

#[tokio::test]
async fn test_malformed_record_is_skipped() {
    let registry = EmbeddedRegistry::new();
    registry.put_data("/fleet/nodes/node-garbage", b"not a record".to_vec());
    let a = discovery(&registry, identity("svc-a", 9001));
    let b = discovery(&registry, identity("svc-b", 9002));
    a.start().await.unwrap();

    b.start().await.unwrap();

    assert_eq!(b.peers(), vec![identity("svc-a", 9001)]);
}

#[tokio::test]
async fn test_initial_connect_failure_is_fatal() {
    let registry = EmbeddedRegistry::new();
    registry.set_available(false);
    let a = discovery(&registry, identity("svc-a", 9001));

    let err = a.start().await.unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, Error::Discovery(DiscoveryError::InitialConnect { .. })));
    assert_eq!(a.state(), DiscoveryState::Disconnected);
}

#[tokio::test]
async fn test_initial_connect_failure_from_connector_is_fatal() {
    let mut connector = MockRegistryConnector::new();
    connector
        .expect_connect()
        .times(1)
        .returning(|_, _| Err(DiscoveryError::ConnectionLoss.into()));
    let a = RegistryDiscoveryService::new(config(), identity("svc-a", 9001), Arc::new(connector));

    let err = a.start().await.unwrap_err();

    assert!(err.is_fatal());
    assert!(a.session_id().is_none());
}

#[tokio::test]
async fn test_failed_directory_setup_closes_the_session() {
    let mut session = MockRegistrySession::new();
    session.expect_session_id().return_const(7u64);
    session
        .expect_ensure_path()
        .returning(|_| Err(DiscoveryError::RegistryUnavailable("read-only".to_string()).into()));
    session.expect_close().times(1).return_const(());
    let session: Arc<dyn RegistrySession> = Arc::new(session);

    let mut connector = MockRegistryConnector::new();
    connector
        .expect_connect()
        .times(1)
        .returning(move |_, _| Ok(session.clone()));
    let a = RegistryDiscoveryService::new(config(), identity("svc-a", 9001), Arc::new(connector));

    let err = a.start().await.unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(a.state(), DiscoveryState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    a.start().await.unwrap();

    a.shutdown().await;

    assert_eq!(a.state(), DiscoveryState::Terminal);
    assert!(registry.children(DIR).is_empty());
    assert!(registry.live_sessions().is_empty());
    assert!(matches!(
        a.publish_self().await.unwrap_err(),
        Error::Discovery(DiscoveryError::Terminated)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_reconnecting() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    a.start().await.unwrap();
    registry.set_available(false);
    registry.expire_session(a.session_id().unwrap());
    eventually("reconnecting state", || a.state() == DiscoveryState::Reconnecting).await;

    a.shutdown().await;
    registry.set_available(true);
    sleep(Duration::from_secs(1)).await;

    assert_eq!(a.state(), DiscoveryState::Terminal);
    assert!(registry.children(DIR).is_empty());
    assert!(registry.live_sessions().is_empty());
}

/// Session that expires itself right after its first record is created,
/// then yields so the watch task sees the loss before the caller resumes.
struct ExpiresAfterCreate {
    inner: Arc<dyn RegistrySession>,
    registry: EmbeddedRegistry,
    fired: AtomicBool,
}

#[async_trait]
impl RegistrySession for ExpiresAfterCreate {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    async fn ensure_path(
        &self,
        path: &str,
    ) -> crate::Result<()> {
        self.inner.ensure_path(path).await
    }

    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: Vec<u8>,
    ) -> crate::Result<String> {
        let path = self.inner.create_ephemeral_sequential(prefix, data).await?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.registry.expire_session(self.inner.session_id());
            sleep(Duration::from_millis(20)).await;
        }
        Ok(path)
    }

    async fn get_data(
        &self,
        path: &str,
    ) -> crate::Result<Option<Vec<u8>>> {
        self.inner.get_data(path).await
    }

    async fn delete(
        &self,
        path: &str,
    ) -> crate::Result<()> {
        self.inner.delete(path).await
    }

    async fn children(
        &self,
        dir: &str,
    ) -> crate::Result<Vec<RegistryNode>> {
        self.inner.children(dir).await
    }

    async fn watch_children(
        &self,
        dir: &str,
    ) -> crate::Result<tokio::sync::mpsc::UnboundedReceiver<RegistryEvent>> {
        self.inner.watch_children(dir).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Hands out a self-expiring session on the `unlucky`-th connect only.
struct UnluckyConnector {
    registry: EmbeddedRegistry,
    connects: AtomicUsize,
    unlucky: usize,
}

#[async_trait]
impl RegistryConnector for UnluckyConnector {
    async fn connect(
        &self,
        url: &str,
        session_timeout: Duration,
    ) -> crate::Result<Arc<dyn RegistrySession>> {
        let session = self.registry.connector().connect(url, session_timeout).await?;
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt != self.unlucky {
            return Ok(session);
        }
        Ok(Arc::new(ExpiresAfterCreate {
            inner: session,
            registry: self.registry.clone(),
            fired: AtomicBool::new(false),
        }))
    }
}

#[tokio::test]
async fn test_session_lost_during_reconnect_is_retried() {
    let registry = EmbeddedRegistry::new();
    let connector = Arc::new(UnluckyConnector {
        registry: registry.clone(),
        connects: AtomicUsize::new(0),
        unlucky: 2,
    });
    let a = RegistryDiscoveryService::new(config(), identity("svc-a", 9001), connector.clone());
    a.start().await.unwrap();
    let first = a.session_id().unwrap();

    registry.expire_session(first);

    eventually("republished on a healthy session", || {
        a.state() == DiscoveryState::Published
            && records_for(&registry, 9001) == 1
            && a.session_id().map_or(false, |id| registry.live_sessions().contains(&id))
    })
    .await;
    assert!(connector.connects.load(Ordering::SeqCst) >= 3);
    assert_eq!(registry.live_sessions().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_membership_snapshots_are_delivered_in_order() {
    let registry = EmbeddedRegistry::new();
    let a = discovery(&registry, identity("svc-a", 9001));
    let delivered: Arc<Mutex<Vec<Vec<InstanceIdentity>>>> = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let sink = delivered.clone();
    let peer_registry = registry.clone();
    a.on_membership_change(Arc::new(move |peers: Vec<InstanceIdentity>| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            // A peer joins while the first snapshot is still being handed over
            let record = MembershipRecord::encode(&identity("svc-b", 9002)).unwrap();
            peer_registry.put_data(&format!("{DIR}/node-peer"), record);
            std::thread::sleep(Duration::from_millis(100));
        }
        sink.lock().push(peers);
    }));

    a.start().await.unwrap();

    eventually("both snapshots delivered", || delivered.lock().len() >= 2).await;
    let delivered = delivered.lock();
    assert!(delivered[0].is_empty());
    assert_eq!(delivered.last().unwrap().len(), 1);
}
