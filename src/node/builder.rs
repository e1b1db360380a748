//! A builder pattern implementation for constructing a [`ClusterNode`].
//!
//! The [`ClusterNodeBuilder`] assembles the local identity, the discovery
//! variant selected by configuration and the partition service.
//!
//! ## Key Design Points
//! - **Default Components**: the discovery backend follows `discovery.backend`; a registry url of
//!   the form `embedded://<name>` is served by a process-local registry.
//! - **Customization**: any other registry is plugged in with `registry_connector()`, and the whole
//!   discovery layer can be replaced with `discovery()`.
//! - **Lifecycle Management**:
//!   - `build()`: assembles the [`ClusterNode`].
//!   - `start_metrics_server()`: launches the Prometheus endpoint.
//!   - `ready()`: returns the assembled node.
//!
//! ## Example
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let node = ClusterNodeBuilder::from_config(node_config, shutdown_rx)
//!     .build()?
//!     .start_metrics_server(shutdown_tx.subscribe())
//!     .ready()?;
//! node.run().await?;
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::ClusterNode;
use crate::connector_for_url;
use crate::metrics;
use crate::ClusterNodeConfig;
use crate::DiscoveryBackend;
use crate::DiscoveryService;
use crate::HashPartitionService;
use crate::InstanceIdentity;
use crate::RegistryConnector;
use crate::RegistryDiscoveryService;
use crate::Result;
use crate::StandaloneDiscoveryService;
use crate::SystemError;

pub struct ClusterNodeBuilder {
    pub(super) node_config: ClusterNodeConfig,
    pub(super) connector: Option<Arc<dyn RegistryConnector>>,
    pub(super) discovery: Option<Arc<dyn DiscoveryService>>,
    pub(super) shutdown_signal: watch::Receiver<()>,

    pub(super) node: Option<Arc<ClusterNode>>,
}

impl ClusterNodeBuilder {
    /// Loads configuration from `CONFIG_PATH` and the environment, then
    /// applies the optional override file.
    ///
    /// # Errors
    /// Configuration that cannot be loaded or does not validate
    pub fn new(
        config_path: Option<&str>,
        shutdown_signal: watch::Receiver<()>,
    ) -> Result<Self> {
        let mut node_config = ClusterNodeConfig::new()?;
        if let Some(p) = config_path {
            info!("with_override_config from: {}", &p);
            node_config = node_config.with_override_config(p)?;
        }
        Ok(Self::from_config(node_config.validate()?, shutdown_signal))
    }

    /// Constructs the builder from an in-memory configuration, validated by `build`
    pub fn from_config(
        node_config: ClusterNodeConfig,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            node_config,
            connector: None,
            discovery: None,
            shutdown_signal,
            node: None,
        }
    }

    /// Registry client used when the backend is `registry`
    pub fn registry_connector(
        mut self,
        connector: Arc<dyn RegistryConnector>,
    ) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replaces the configured discovery variant entirely
    pub fn discovery(
        mut self,
        discovery: Arc<dyn DiscoveryService>,
    ) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Assembles the node. Nothing is connected until the node starts.
    ///
    /// # Errors
    /// `Error::Config` when the configuration does not validate or the
    /// registry url has no connector
    pub fn build(mut self) -> Result<Self> {
        let node_config = self.node_config.clone().validate()?;
        let identity = InstanceIdentity::from_config(&node_config.service);

        let discovery: Arc<dyn DiscoveryService> = match self.discovery.take() {
            Some(discovery) => discovery,
            None => match node_config.discovery.backend {
                DiscoveryBackend::Standalone => Arc::new(StandaloneDiscoveryService::new(identity.clone())),
                DiscoveryBackend::Registry => {
                    let connector = match self.connector.take() {
                        Some(connector) => connector,
                        None => connector_for_url(&node_config.discovery.url)?,
                    };
                    Arc::new(RegistryDiscoveryService::new(
                        node_config.discovery.clone(),
                        identity.clone(),
                        connector,
                    ))
                }
            },
        };

        let partitions = Arc::new(HashPartitionService::new(node_config.partitions.clone(), identity));

        info!(
            "built node {} with {:?} discovery",
            discovery.self_identity(),
            node_config.discovery.backend
        );
        self.node = Some(Arc::new(ClusterNode::new(
            Arc::new(node_config),
            discovery,
            partitions,
            self.shutdown_signal.clone(),
        )));
        Ok(self)
    }

    /// Starts the metrics server for monitoring node operations.
    ///
    /// Launches a Prometheus endpoint on the configured port when enabled.
    pub fn start_metrics_server(
        self,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        if self.node_config.monitoring.prometheus_enabled {
            let port = self.node_config.monitoring.prometheus_port;
            info!("starting metrics server on port {}", port);
            tokio::spawn(async move {
                metrics::start_server(port, shutdown_signal).await;
            });
        }
        self
    }

    /// Returns the built node instance after successful construction.
    ///
    /// # Errors
    /// `SystemError::NodeStartFailed` if `build()` has not run
    pub fn ready(self) -> Result<Arc<ClusterNode>> {
        self.node
            .ok_or_else(|| SystemError::NodeStartFailed("node has not been built".to_string()).into())
    }
}
