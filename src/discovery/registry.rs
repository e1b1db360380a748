use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use crate::Result;

/// One child entry of a watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryNode {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ChildAdded(RegistryNode),
    ChildUpdated(RegistryNode),
    ChildRemoved(String),
    /// The session is gone and all of its ephemeral nodes with it
    SessionExpired,
}

/// Opens sessions against a coordination registry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
        session_timeout: Duration,
    ) -> Result<Arc<dyn RegistrySession>>;
}

/// A live registry session. Ephemeral nodes live exactly as long as the
/// session that created them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistrySession: Send + Sync + 'static {
    fn session_id(&self) -> u64;

    /// Creates `path` and any missing ancestors as persistent nodes
    async fn ensure_path(
        &self,
        path: &str,
    ) -> Result<()>;

    /// Returns the full path, `prefix` followed by a zero-padded sequence
    async fn create_ephemeral_sequential(
        &self,
        prefix: &str,
        data: Vec<u8>,
    ) -> Result<String>;

    async fn get_data(
        &self,
        path: &str,
    ) -> Result<Option<Vec<u8>>>;

    async fn delete(
        &self,
        path: &str,
    ) -> Result<()>;

    async fn children(
        &self,
        dir: &str,
    ) -> Result<Vec<RegistryNode>>;

    /// Events about direct children of `dir` until the session ends
    async fn watch_children(
        &self,
        dir: &str,
    ) -> Result<mpsc::UnboundedReceiver<RegistryEvent>>;

    async fn close(&self);
}
