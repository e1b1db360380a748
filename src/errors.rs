//! Cluster membership and partition routing error hierarchy
//!
//! Errors are grouped by the layer that produces them so that callers can
//! tell a fatal startup failure apart from a transient registry hiccup or a
//! routing decision that must be retried later.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

use crate::ServiceRole;
use crate::TenantId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (serialization, background tasks, signals)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Membership registry and discovery failures
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Partition routing failures
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Startup failures the process should not try to survive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fatal(_) | Error::Config(_) | Error::Discovery(DiscoveryError::InitialConnect { .. })
        )
    }

    /// Failures the discovery state machine absorbs by retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Discovery(e) => e.is_transient(),
            Error::Routing(RoutingError::NoOwnerAvailable { .. }) => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Membership record encoding failures
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0}")]
    SignalSendFailed(String),

    #[error("Node start failed: {0}")]
    NodeStartFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The very first registry connection failed; the process should exit
    #[error("Initial connection to registry {url} failed: {reason}")]
    InitialConnect { url: String, reason: String },

    #[error("Registry connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Registry refuses new sessions
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// An established session can no longer reach the registry
    #[error("Registry connection lost")]
    ConnectionLoss,

    #[error("Registry session {0} expired")]
    SessionExpired(u64),

    #[error("Registry node not found: {0}")]
    NodeNotFound(String),

    #[error("Discovery service is not connected to the registry")]
    NotConnected,

    #[error("Discovery service has been shut down")]
    Terminated,

    #[error("Malformed membership record at {path}: {reason}")]
    MalformedRecord { path: String, reason: String },
}

impl DiscoveryError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DiscoveryError::ConnectTimeout(_)
                | DiscoveryError::RegistryUnavailable(_)
                | DiscoveryError::ConnectionLoss
                | DiscoveryError::SessionExpired(_)
                | DiscoveryError::NotConnected
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// No live instance currently serves the ring; callers queue and retry
    #[error("No owner available for role {role} (tenant: {tenant:?})")]
    NoOwnerAvailable {
        role: ServiceRole,
        tenant: Option<TenantId>,
    },
}
