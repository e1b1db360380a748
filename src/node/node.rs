//! A running fleet instance.
//!
//! ## Key Responsibilities
//! - Starts discovery and fails fast if the registry is unreachable at startup
//! - Feeds every membership snapshot into the partition service, in the order observed
//! - Tears discovery down on the shutdown signal
//!
//! ## Example Usage
//! ```rust,ignore
//! let node = ClusterNodeBuilder::from_config(config, shutdown_rx).build()?.ready()?;
//! tokio::spawn(async move {
//!     node.run().await.expect("node execution failed");
//! });
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::utils::async_task::spawn_task;
use crate::ClusterEvent;
use crate::ClusterNodeConfig;
use crate::DiscoveryService;
use crate::DiscoveryState;
use crate::HashPartitionService;
use crate::InstanceIdentity;
use crate::PartitionService;
use crate::Result;

pub struct ClusterNode {
    pub(crate) config: Arc<ClusterNodeConfig>,
    pub(crate) discovery: Arc<dyn DiscoveryService>,
    pub(crate) partitions: Arc<HashPartitionService>,
    pub(crate) shutdown_signal: watch::Receiver<()>,

    membership_task: Mutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl ClusterNode {
    pub(crate) fn new(
        config: Arc<ClusterNodeConfig>,
        discovery: Arc<dyn DiscoveryService>,
        partitions: Arc<HashPartitionService>,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            config,
            discovery,
            partitions,
            shutdown_signal,
            membership_task: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Joins the fleet and computes the first partition assignment.
    ///
    /// # Errors
    /// The initial registry connection failure, which is fatal
    pub async fn start(&self) -> Result<()> {
        // 1. Queue membership snapshots so rebuilds apply in arrival order
        let (peers_tx, peers_rx) = mpsc::unbounded_channel::<Vec<InstanceIdentity>>();
        self.discovery
            .on_membership_change(Arc::new(move |peers: Vec<InstanceIdentity>| {
                if peers_tx.send(peers).is_err() {
                    debug!("membership snapshot dropped: node stopped");
                }
            }));

        // 2. Connect and publish
        self.discovery.start().await?;

        // 3. Initial assignment from whatever is already known
        let local = self.discovery.self_identity();
        self.partitions.recalculate(&local, &self.discovery.peers());

        // 4. Keep the rings in sync with membership
        let task = spawn_task(
            "membership",
            Self::apply_membership(
                local,
                self.partitions.clone(),
                peers_rx,
                self.shutdown_signal.clone(),
            ),
        );
        if let Some(previous) = self.membership_task.lock().replace(task) {
            previous.abort();
        }

        self.set_ready(true);
        info!("node {} started", self.discovery.self_identity());
        Ok(())
    }

    async fn apply_membership(
        local: Arc<InstanceIdentity>,
        partitions: Arc<HashPartitionService>,
        mut peers_rx: mpsc::UnboundedReceiver<Vec<InstanceIdentity>>,
        mut shutdown_signal: watch::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_signal.changed() => {
                    debug!("membership task received shutdown signal");
                    return Ok(());
                }
                peers = peers_rx.recv() => {
                    match peers {
                        Some(peers) => partitions.recalculate(&local, &peers),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Starts the node and serves until the shutdown signal fires.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let mut shutdown_signal = self.shutdown_signal.clone();
        if shutdown_signal.changed().await.is_err() {
            debug!("shutdown sender dropped");
        }

        self.shutdown().await;
        Ok(())
    }

    /// Leaves the fleet: the local record is deleted and reconnection stops.
    pub async fn shutdown(&self) {
        self.set_ready(false);
        self.discovery.shutdown().await;
        let task = self.membership_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        info!("node {} stopped", self.discovery.self_identity());
    }

    pub fn partition_service(&self) -> Arc<HashPartitionService> {
        self.partitions.clone()
    }

    pub fn discovery(&self) -> Arc<dyn DiscoveryService> {
        self.discovery.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.partitions.subscribe()
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn config(&self) -> &ClusterNodeConfig {
        &self.config
    }

    pub fn set_ready(
        &self,
        is_ready: bool,
    ) {
        self.ready.store(is_ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
