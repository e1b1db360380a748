//! Registry-backed discovery.
//!
//! Each instance owns one ephemeral-sequential record under the configured
//! registry path. Peers are learned from a child watch on that path.
//!
//! State machine:
//! ```text
//! DISCONNECTED --connect--> CONNECTED_UNPUBLISHED --publish--> PUBLISHED
//! PUBLISHED --session loss--> RECONNECTING --reconnect + publish--> PUBLISHED
//! any --shutdown--> TERMINAL
//! ```
//! The transition into RECONNECTING is taken under the state mutex and is the
//! only way a reconnect worker gets spawned, so at most one worker runs. A
//! session lost while that worker runs is flagged instead, and the worker
//! retries rather than reporting success.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::DiscoveryService;
use super::DiscoveryState;
use super::MembershipListener;
use super::RegistryConnector;
use super::RegistryEvent;
use super::RegistryNode;
use super::RegistrySession;
use crate::constants::MEMBERSHIP_NODE_PREFIX;
use crate::metrics::DISCOVERY_STATE_METRIC;
use crate::metrics::REGISTRY_RECONNECT_METRIC;
use crate::DiscoveryConfig;
use crate::DiscoveryError;
use crate::InstanceIdentity;
use crate::MembershipRecord;
use crate::Result;

pub struct RegistryDiscoveryService {
    inner: Arc<DiscoveryInner>,
}

struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    identity: Arc<InstanceIdentity>,
    connector: Arc<dyn RegistryConnector>,

    state: Mutex<DiscoveryState>,
    /// Set under the state mutex when the worker's own session is lost
    lost_while_reconnecting: AtomicBool,
    session: Mutex<Option<Arc<dyn RegistrySession>>>,
    self_path: Mutex<Option<String>>,
    /// Serializes publish, unpublish and republish
    publish_lock: tokio::sync::Mutex<()>,

    /// Peer records by registry path
    peers: RwLock<BTreeMap<String, InstanceIdentity>>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    /// Snapshots reach listeners in the order they were taken
    notify_lock: Mutex<()>,

    shutdown: CancellationToken,
    watch: Mutex<Option<WatchHandle>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryDiscoveryService {
    pub fn new(
        config: DiscoveryConfig,
        identity: InstanceIdentity,
        connector: Arc<dyn RegistryConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                identity: Arc::new(identity),
                connector,
                state: Mutex::new(DiscoveryState::Disconnected),
                lost_while_reconnecting: AtomicBool::new(false),
                session: Mutex::new(None),
                self_path: Mutex::new(None),
                publish_lock: tokio::sync::Mutex::new(()),
                peers: RwLock::new(BTreeMap::new()),
                listeners: RwLock::new(Vec::new()),
                notify_lock: Mutex::new(()),
                shutdown: CancellationToken::new(),
                watch: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    /// Path of the local record, if one is live
    pub fn self_path(&self) -> Option<String> {
        self.inner.self_path.lock().clone()
    }

    /// Id of the current registry session
    pub fn session_id(&self) -> Option<u64> {
        self.inner.session.lock().as_ref().map(|session| session.session_id())
    }
}

#[async_trait]
impl DiscoveryService for RegistryDiscoveryService {
    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.state() != DiscoveryState::Disconnected {
            warn!("discovery already started, state {}", inner.state());
            return Ok(());
        }

        let session = match inner.open_session().await {
            Ok(session) => session,
            Err(e) => {
                error!("initial registry connection to {} failed: {:?}", inner.config.url, e);
                return Err(DiscoveryError::InitialConnect {
                    url: inner.config.url.clone(),
                    reason: e.to_string(),
                }
                .into());
            }
        };
        if let Err(e) = inner.attach(session.clone()).await {
            session.close().await;
            return Err(DiscoveryError::InitialConnect {
                url: inner.config.url.clone(),
                reason: e.to_string(),
            }
            .into());
        }
        inner.transition(DiscoveryState::Disconnected, DiscoveryState::ConnectedUnpublished);

        if let Err(e) = inner.publish_self().await {
            warn!("initial publish failed, retrying in background: {:?}", e);
            inner.schedule_reconnect();
        }
        inner.notify_listeners();
        Ok(())
    }

    async fn publish_self(&self) -> Result<()> {
        self.inner.publish_self().await
    }

    async fn unpublish_self(&self) {
        self.inner.unpublish_self().await
    }

    fn on_membership_change(
        &self,
        listener: Arc<dyn MembershipListener>,
    ) {
        self.inner.listeners.write().push(listener);
    }

    fn peers(&self) -> Vec<InstanceIdentity> {
        self.inner.peer_snapshot()
    }

    fn state(&self) -> DiscoveryState {
        self.inner.state()
    }

    fn self_identity(&self) -> Arc<InstanceIdentity> {
        self.inner.identity.clone()
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        inner.set_state(DiscoveryState::Terminal);
        inner.shutdown.cancel();

        let reconnect = inner.reconnect.lock().take();
        if let Some(task) = reconnect {
            task.abort();
            let _ = task.await;
        }

        inner.unpublish_self().await;
        inner.teardown_session().await;
        inner.peers.write().clear();
        info!("discovery for {} terminated", inner.identity);
    }
}

impl DiscoveryInner {
    fn state(&self) -> DiscoveryState {
        *self.state.lock()
    }

    fn set_state(
        &self,
        next: DiscoveryState,
    ) {
        let mut state = self.state.lock();
        Self::apply(&mut state, next);
    }

    /// Moves to `next` only from `expected`
    fn transition(
        &self,
        expected: DiscoveryState,
        next: DiscoveryState,
    ) -> bool {
        let mut state = self.state.lock();
        if *state != expected {
            return false;
        }
        Self::apply(&mut state, next);
        true
    }

    fn apply(
        state: &mut DiscoveryState,
        next: DiscoveryState,
    ) {
        if *state != next {
            debug!("discovery state {} -> {}", state, next);
            *state = next;
            DISCOVERY_STATE_METRIC.set(next.as_metric());
        }
    }

    fn current_session(&self) -> Result<Arc<dyn RegistrySession>> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| DiscoveryError::NotConnected.into())
    }

    fn record_prefix(&self) -> String {
        format!("{}/{}", self.config.registry_path, MEMBERSHIP_NODE_PREFIX)
    }

    async fn open_session(&self) -> Result<Arc<dyn RegistrySession>> {
        let limit = self.config.connection_timeout();
        match timeout(limit, self.connector.connect(&self.config.url, self.config.session_timeout())).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::ConnectTimeout(limit).into()),
        }
    }

    /// Makes `session` current: watch first, then list, so no child event
    /// falls between the two.
    async fn attach(
        self: &Arc<Self>,
        session: Arc<dyn RegistrySession>,
    ) -> Result<()> {
        let dir = &self.config.registry_path;
        session.ensure_path(dir).await?;
        let events = session.watch_children(dir).await?;
        let nodes = session.children(dir).await?;

        {
            let mut peers = self.peers.write();
            peers.clear();
            for node in nodes {
                if let Some(identity) = self.accept_peer(&node) {
                    peers.insert(node.path, identity);
                }
            }
        }

        *self.session.lock() = Some(session.clone());

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(self.clone().watch_loop(session.session_id(), events, cancel.clone()));
        if let Some(previous) = self.watch.lock().replace(WatchHandle { cancel, task }) {
            previous.cancel.cancel();
        }
        debug!("attached to registry session {}", session.session_id());
        Ok(())
    }

    /// Cancels the watch, forgets the local record and closes the session.
    async fn teardown_session(&self) {
        let watch = self.watch.lock().take();
        if let Some(watch) = watch {
            watch.cancel.cancel();
            let _ = watch.task.await;
        }
        self.self_path.lock().take();
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
            debug!("closed registry session {}", session.session_id());
        }
    }

    /// Decodes a peer record. Records of the local instance, including
    /// leftovers of an earlier incarnation, are not peers.
    fn accept_peer(
        &self,
        node: &RegistryNode,
    ) -> Option<InstanceIdentity> {
        if self.self_path.lock().as_deref() == Some(node.path.as_str()) {
            return None;
        }
        match MembershipRecord::decode(&node.path, &node.data) {
            Ok(identity) if identity.address() == self.identity.address() => {
                trace!("ignoring record {} carrying the local address", node.path);
                None
            }
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("skipping membership record: {:?}", e);
                None
            }
        }
    }

    fn peer_snapshot(&self) -> Vec<InstanceIdentity> {
        self.peers.read().values().cloned().collect()
    }

    fn notify_listeners(&self) {
        let _ordered = self.notify_lock.lock();
        let peers = self.peer_snapshot();
        let listeners = self.listeners.read().clone();
        trace!("membership snapshot of {} peer(s) to {} listener(s)", peers.len(), listeners.len());
        for listener in listeners {
            listener.on_membership_change(peers.clone());
        }
    }

    async fn watch_loop(
        self: Arc<Self>,
        session_id: u64,
        mut events: tokio::sync::mpsc::UnboundedReceiver<RegistryEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("watch on session {} cancelled", session_id);
                    return;
                }
                event = events.recv() => {
                    match event {
                        Some(RegistryEvent::SessionExpired) | None => {
                            warn!("registry session {} lost", session_id);
                            self.on_session_lost(session_id);
                            return;
                        }
                        Some(event) => self.on_child_event(event),
                    }
                }
            }
        }
    }

    fn on_child_event(
        self: &Arc<Self>,
        event: RegistryEvent,
    ) {
        let changed = match event {
            RegistryEvent::ChildAdded(node) | RegistryEvent::ChildUpdated(node) => match self.accept_peer(&node) {
                Some(identity) => {
                    debug!("peer record {} -> {}", node.path, identity);
                    self.peers.write().insert(node.path, identity);
                    true
                }
                None => self.peers.write().remove(&node.path).is_some(),
            },
            RegistryEvent::ChildRemoved(path) => {
                if self.self_path.lock().as_deref() == Some(path.as_str()) {
                    self.on_self_record_lost(path);
                    false
                } else {
                    self.peers.write().remove(&path).is_some()
                }
            }
            RegistryEvent::SessionExpired => false,
        };

        if changed {
            self.notify_listeners();
        }
    }

    /// Republishes off the watch task so later events keep flowing.
    fn on_self_record_lost(
        self: &Arc<Self>,
        path: String,
    ) {
        warn!("local record {} disappeared, republishing", path);
        {
            let mut self_path = self.self_path.lock();
            if self_path.as_deref() == Some(path.as_str()) {
                *self_path = None;
            }
        }
        self.transition(DiscoveryState::Published, DiscoveryState::ConnectedUnpublished);

        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.publish_self().await {
                warn!("republish failed: {:?}", e);
                inner.schedule_reconnect();
            }
        });
    }

    fn on_session_lost(
        self: &Arc<Self>,
        session_id: u64,
    ) {
        let current = self.session.lock().as_ref().map(|session| session.session_id());
        if current != Some(session_id) {
            debug!("ignoring loss of stale session {}", session_id);
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            match *state {
                DiscoveryState::Terminal => return,
                DiscoveryState::Reconnecting => {
                    debug!("reconnect already running, flagging it to retry");
                    self.lost_while_reconnecting.store(true, Ordering::SeqCst);
                    return;
                }
                _ => Self::apply(&mut state, DiscoveryState::Reconnecting),
            }
        }

        info!("scheduling registry reconnect for {}", self.identity);
        let inner = self.clone();
        let task = tokio::spawn(async move { inner.reconnect_loop().await });
        *self.reconnect.lock() = Some(task);
    }

    /// Retries at a fixed interval until reconnected or shut down.
    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt: u64 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            attempt += 1;

            match self.reestablish().await {
                Ok(()) => {
                    REGISTRY_RECONNECT_METRIC.with_label_values(&["success"]).inc();
                    info!("registry session re-established after {} attempt(s)", attempt);
                    self.notify_listeners();
                    return;
                }
                Err(e) => {
                    REGISTRY_RECONNECT_METRIC.with_label_values(&["failure"]).inc();
                    warn!("reconnect attempt {} failed: {:?}", attempt, e);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(self.config.retry_interval()) => {}
            }
        }
    }

    /// Old client fully released before the new one is created.
    #[instrument(skip_all, fields(service_id = %self.identity.service_id()))]
    async fn reestablish(self: &Arc<Self>) -> Result<()> {
        self.teardown_session().await;
        self.lost_while_reconnecting.store(false, Ordering::SeqCst);

        let session = self.open_session().await?;
        if let Err(e) = self.attach(session.clone()).await {
            self.teardown_session().await;
            session.close().await;
            return Err(e);
        }
        self.publish_self().await?;

        let outcome = {
            let mut state = self.state.lock();
            if *state != DiscoveryState::Reconnecting {
                Err(DiscoveryError::Terminated)
            } else if self.lost_while_reconnecting.swap(false, Ordering::SeqCst) {
                Err(DiscoveryError::ConnectionLoss)
            } else {
                Self::apply(&mut state, DiscoveryState::Published);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            // shut down, or the fresh session is already gone
            self.teardown_session().await;
            return Err(e.into());
        }
        Ok(())
    }

    #[instrument(skip_all, fields(service_id = %self.identity.service_id()))]
    async fn publish_self(&self) -> Result<()> {
        let _guard = self.publish_lock.lock().await;
        if self.state() == DiscoveryState::Terminal {
            return Err(DiscoveryError::Terminated.into());
        }
        let session = self.current_session()?;

        let existing = self.self_path.lock().clone();
        if let Some(path) = existing {
            match session.get_data(&path).await? {
                Some(data) => match MembershipRecord::decode(&path, &data) {
                    Ok(record) if record.address() == self.identity.address() => {
                        debug!("record {} already published", path);
                        self.transition(DiscoveryState::ConnectedUnpublished, DiscoveryState::Published);
                        return Ok(());
                    }
                    Ok(record) => warn!(
                        "record {} points to {} instead of {}, replacing",
                        path,
                        record.address(),
                        self.identity.address()
                    ),
                    Err(e) => warn!("record {} is unreadable, replacing: {:?}", path, e),
                },
                None => debug!("record {} is gone", path),
            }

            self.self_path.lock().take();
            if let Err(e) = session.delete(&path).await {
                debug!("stale record {} not deleted: {:?}", path, e);
            }
        }

        self.purge_previous_incarnations(&session).await?;

        let data = MembershipRecord::encode(&self.identity)?;
        let path = session.create_ephemeral_sequential(&self.record_prefix(), data).await?;
        info!("published {} at {}", self.identity, path);
        *self.self_path.lock() = Some(path);

        self.transition(DiscoveryState::ConnectedUnpublished, DiscoveryState::Published);
        Ok(())
    }

    /// Deletes records a crashed earlier run of this instance left behind
    /// before their session timed out.
    async fn purge_previous_incarnations(
        &self,
        session: &Arc<dyn RegistrySession>,
    ) -> Result<()> {
        for node in session.children(&self.config.registry_path).await? {
            let Ok(record) = MembershipRecord::decode(&node.path, &node.data) else {
                continue;
            };
            let same_instance = record.address() == self.identity.address()
                || record.service_id() == self.identity.service_id();
            if same_instance {
                info!("removing leftover record {} of {}", node.path, record);
                if let Err(e) = session.delete(&node.path).await {
                    debug!("leftover record {} not deleted: {:?}", node.path, e);
                }
            }
        }
        Ok(())
    }

    async fn unpublish_self(&self) {
        let _guard = self.publish_lock.lock().await;
        let Some(path) = self.self_path.lock().take() else {
            return;
        };
        self.transition(DiscoveryState::Published, DiscoveryState::ConnectedUnpublished);

        match self.current_session() {
            Ok(session) => match session.delete(&path).await {
                Ok(()) => info!("unpublished {}", path),
                Err(e) => warn!("failed to delete record {}: {:?}", path, e),
            },
            Err(e) => warn!("cannot unpublish {}: {:?}", path, e),
        }
    }
}
