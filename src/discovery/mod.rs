//! Cluster membership discovery.
//!
//! A [`DiscoveryService`] makes the local instance visible to its peers and
//! reports the live peer set. Two variants exist, picked once at startup:
//! - [`RegistryDiscoveryService`]: ephemeral records in a coordination
//!   registry, with automatic reconnection after session loss
//! - [`StandaloneDiscoveryService`]: a fleet of one, no registry

mod embedded_registry;
mod registry;
mod registry_discovery;
mod standalone;

pub use embedded_registry::*;
pub use registry::*;
pub use registry_discovery::*;
pub use standalone::*;

#[cfg(test)]
mod registry_discovery_test;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use config::ConfigError;
#[cfg(test)]
use mockall::automock;

use crate::InstanceIdentity;
use crate::Result;

/// Scheme of urls served by a process-local [`EmbeddedRegistry`]
pub const EMBEDDED_SCHEME: &str = "embedded://";

/// Resolves the connector serving `url`. Only `embedded://<name>` is built
/// in; other registries are plugged in through the node builder.
pub fn connector_for_url(url: &str) -> Result<Arc<dyn RegistryConnector>> {
    match url.strip_prefix(EMBEDDED_SCHEME) {
        Some(name) if !name.is_empty() => Ok(EmbeddedRegistry::named(name).connector()),
        _ => Err(ConfigError::Message(format!("no registry connector available for {url}")).into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Disconnected,
    ConnectedUnpublished,
    Published,
    Reconnecting,
    /// Shut down, never reconnects
    Terminal,
}

impl DiscoveryState {
    pub(crate) fn as_metric(&self) -> i64 {
        match self {
            DiscoveryState::Disconnected => 0,
            DiscoveryState::ConnectedUnpublished => 1,
            DiscoveryState::Published => 2,
            DiscoveryState::Reconnecting => 3,
            DiscoveryState::Terminal => 4,
        }
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            DiscoveryState::Disconnected => "DISCONNECTED",
            DiscoveryState::ConnectedUnpublished => "CONNECTED_UNPUBLISHED",
            DiscoveryState::Published => "PUBLISHED",
            DiscoveryState::Reconnecting => "RECONNECTING",
            DiscoveryState::Terminal => "TERMINAL",
        };
        f.write_str(name)
    }
}

/// Receives the full peer snapshot, local instance excluded, after every
/// membership change.
///
/// Called on the registry watch task: implementations must return quickly.
pub trait MembershipListener: Send + Sync + 'static {
    fn on_membership_change(
        &self,
        peers: Vec<InstanceIdentity>,
    );
}

impl<F> MembershipListener for F
where
    F: Fn(Vec<InstanceIdentity>) + Send + Sync + 'static,
{
    fn on_membership_change(
        &self,
        peers: Vec<InstanceIdentity>,
    ) {
        self(peers)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryService: Send + Sync + 'static {
    /// Connects and publishes the local record.
    ///
    /// # Errors
    /// `DiscoveryError::InitialConnect` if the very first connection fails.
    /// Failures after that are retried in the background.
    async fn start(&self) -> Result<()>;

    /// Idempotent: a live record carrying the local address is left alone,
    /// a record carrying any other address is replaced.
    async fn publish_self(&self) -> Result<()>;

    /// Best effort, errors are logged
    async fn unpublish_self(&self);

    fn on_membership_change(
        &self,
        listener: Arc<dyn MembershipListener>,
    );

    /// Live peers, local instance excluded
    fn peers(&self) -> Vec<InstanceIdentity>;

    fn state(&self) -> DiscoveryState;

    fn self_identity(&self) -> Arc<InstanceIdentity>;

    /// Deletes the local record, stops reconnecting and releases the session.
    async fn shutdown(&self);
}
