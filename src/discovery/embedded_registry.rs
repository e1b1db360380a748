//! Process-local coordination registry.
//!
//! Implements the session, ephemeral-sequential node and child-watch
//! semantics the discovery layer relies on, entirely in memory. Several
//! instances in one process (integration tests, single-host demos) share
//! membership by connecting to the same `embedded://<name>` registry.
//!
//! All mutations and their watch notifications happen under one lock, so
//! every watcher observes changes in the same order.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;

use super::RegistryConnector;
use super::RegistryEvent;
use super::RegistryNode;
use super::RegistrySession;
use crate::constants::SEQUENCE_SUFFIX_WIDTH;
use crate::DiscoveryError;
use crate::Result;

lazy_static! {
    static ref NAMED_REGISTRIES: Mutex<HashMap<String, EmbeddedRegistry>> = Mutex::new(HashMap::new());
}

struct StoredNode {
    data: Vec<u8>,
    /// Owning session of an ephemeral node
    owner: Option<u64>,
}

struct Watcher {
    dir: String,
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

#[derive(Default)]
struct SessionEntry {
    watchers: Vec<Watcher>,
}

struct RegistryTree {
    available: bool,
    next_session_id: u64,
    dirs: BTreeSet<String>,
    nodes: BTreeMap<String, StoredNode>,
    sequences: HashMap<String, u64>,
    sessions: HashMap<u64, SessionEntry>,
}

impl RegistryTree {
    fn new() -> Self {
        Self {
            available: true,
            next_session_id: 1,
            dirs: BTreeSet::new(),
            nodes: BTreeMap::new(),
            sequences: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    fn check_session(
        &self,
        session_id: u64,
    ) -> Result<()> {
        if !self.available {
            return Err(DiscoveryError::RegistryUnavailable("embedded registry is offline".to_string()).into());
        }
        if !self.sessions.contains_key(&session_id) {
            return Err(DiscoveryError::SessionExpired(session_id).into());
        }
        Ok(())
    }

    fn notify(
        &mut self,
        path: &str,
        event: RegistryEvent,
    ) {
        let dir = parent_of(path);
        for session in self.sessions.values_mut() {
            session
                .watchers
                .retain(|watcher| watcher.dir != dir || watcher.tx.send(event.clone()).is_ok());
        }
    }

    fn remove_node(
        &mut self,
        path: &str,
    ) -> bool {
        if self.nodes.remove(path).is_some() {
            self.notify(path, RegistryEvent::ChildRemoved(path.to_string()));
            true
        } else {
            false
        }
    }

    /// Drops the session, then its ephemeral nodes. The session's own
    /// watchers are gone before the removals are announced.
    fn end_session(
        &mut self,
        session_id: u64,
        expired: bool,
    ) -> bool {
        let Some(entry) = self.sessions.remove(&session_id) else {
            return false;
        };
        if expired {
            for watcher in &entry.watchers {
                let _ = watcher.tx.send(RegistryEvent::SessionExpired);
            }
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }
        true
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

#[derive(Clone)]
pub struct EmbeddedRegistry {
    tree: Arc<Mutex<RegistryTree>>,
}

impl EmbeddedRegistry {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(RegistryTree::new())),
        }
    }

    /// Process-wide registry registered under `name`, created on first use
    pub fn named(name: &str) -> Self {
        NAMED_REGISTRIES
            .lock()
            .entry(name.to_string())
            .or_insert_with(EmbeddedRegistry::new)
            .clone()
    }

    pub fn connector(&self) -> Arc<dyn RegistryConnector> {
        Arc::new(EmbeddedConnector { registry: self.clone() })
    }

    /// Ends a session the way a registry does after missed heartbeats.
    pub fn expire_session(
        &self,
        session_id: u64,
    ) -> bool {
        let expired = self.tree.lock().end_session(session_id, true);
        if expired {
            info!("embedded registry expired session {}", session_id);
        }
        expired
    }

    /// While offline, new connections and all session operations fail.
    pub fn set_available(
        &self,
        available: bool,
    ) {
        self.tree.lock().available = available;
        debug!("embedded registry available: {}", available);
    }

    /// Creates a persistent node or replaces the payload of an existing one.
    pub fn put_data(
        &self,
        path: &str,
        data: Vec<u8>,
    ) {
        let mut tree = self.tree.lock();
        let node = RegistryNode {
            path: path.to_string(),
            data: data.clone(),
        };
        let event = match tree.nodes.get_mut(path) {
            Some(existing) => {
                existing.data = data;
                RegistryEvent::ChildUpdated(node)
            }
            None => {
                tree.nodes.insert(path.to_string(), StoredNode { data, owner: None });
                RegistryEvent::ChildAdded(node)
            }
        };
        tree.notify(path, event);
    }

    pub fn remove(
        &self,
        path: &str,
    ) -> bool {
        self.tree.lock().remove_node(path)
    }

    pub fn children(
        &self,
        dir: &str,
    ) -> Vec<RegistryNode> {
        let tree = self.tree.lock();
        tree.nodes
            .iter()
            .filter(|(path, _)| parent_of(path) == dir)
            .map(|(path, node)| RegistryNode {
                path: path.clone(),
                data: node.data.clone(),
            })
            .collect()
    }

    pub fn live_sessions(&self) -> Vec<u64> {
        let mut sessions: Vec<u64> = self.tree.lock().sessions.keys().copied().collect();
        sessions.sort_unstable();
        sessions
    }

    fn open_session(&self) -> Result<u64> {
        let mut tree = self.tree.lock();
        if !tree.available {
            return Err(DiscoveryError::RegistryUnavailable("embedded registry is offline".to_string()).into());
        }
        let session_id = tree.next_session_id;
        tree.next_session_id += 1;
        tree.sessions.insert(session_id, SessionEntry::default());
        Ok(session_id)
    }
}

impl Default for EmbeddedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct EmbeddedConnector {
    registry: EmbeddedRegistry,
}

#[async_trait]
impl RegistryConnector for EmbeddedConnector {
    async fn connect(
        &self,
        url: &str,
        session_timeout: Duration,
    ) -> Result<Arc<dyn RegistrySession>> {
        let session_id = self.registry.open_session()?;
        debug!(
            "opened embedded session {} for {} (timeout {:?})",
            session_id, url, session_timeout
        );
        Ok(Arc::new(EmbeddedSession {
            registry: self.registry.clone(),
            session_id,
        }))
    }
}

struct EmbeddedSession {
    registry: EmbeddedRegistry,
    session_id: u64,
}

#[async_trait]
impl RegistrySession for EmbeddedSession {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn ensure_path(
        &self,
        path: &str,
    ) -> Result<()> {
        let mut tree = self.registry.tree.lock();
        tree.check_session(self.session_id)?;
        let mut current = path;
        while !current.is_empty() && current != "/" {
            tree.dirs.insert(current.to_string());
            current = parent_of(current);
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: Vec<u8>,
    ) -> Result<String> {
        let mut tree = self.registry.tree.lock();
        tree.check_session(self.session_id)?;

        let dir = parent_of(prefix).to_string();
        if !tree.dirs.contains(&dir) {
            return Err(DiscoveryError::NodeNotFound(dir).into());
        }
        let sequence = tree.sequences.entry(dir).or_insert(0);
        let path = format!("{}{:0width$}", prefix, *sequence, width = SEQUENCE_SUFFIX_WIDTH);
        *sequence += 1;

        tree.nodes.insert(
            path.clone(),
            StoredNode {
                data: data.clone(),
                owner: Some(self.session_id),
            },
        );
        tree.notify(
            &path,
            RegistryEvent::ChildAdded(RegistryNode {
                path: path.clone(),
                data,
            }),
        );
        Ok(path)
    }

    async fn get_data(
        &self,
        path: &str,
    ) -> Result<Option<Vec<u8>>> {
        let tree = self.registry.tree.lock();
        tree.check_session(self.session_id)?;
        Ok(tree.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn delete(
        &self,
        path: &str,
    ) -> Result<()> {
        let mut tree = self.registry.tree.lock();
        tree.check_session(self.session_id)?;
        if tree.remove_node(path) {
            Ok(())
        } else {
            Err(DiscoveryError::NodeNotFound(path.to_string()).into())
        }
    }

    async fn children(
        &self,
        dir: &str,
    ) -> Result<Vec<RegistryNode>> {
        self.registry.tree.lock().check_session(self.session_id)?;
        Ok(self.registry.children(dir))
    }

    async fn watch_children(
        &self,
        dir: &str,
    ) -> Result<mpsc::UnboundedReceiver<RegistryEvent>> {
        let mut tree = self.registry.tree.lock();
        tree.check_session(self.session_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(session) = tree.sessions.get_mut(&self.session_id) {
            session.watchers.push(Watcher {
                dir: dir.to_string(),
                tx,
            });
        }
        Ok(rx)
    }

    async fn close(&self) {
        if self.registry.tree.lock().end_session(self.session_id, false) {
            debug!("closed embedded session {}", self.session_id);
        }
    }
}
