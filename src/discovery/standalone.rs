use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::DiscoveryService;
use super::DiscoveryState;
use super::MembershipListener;
use crate::InstanceIdentity;
use crate::Result;

/// Discovery for a fleet of one: nothing is published and no peer ever
/// appears.
pub struct StandaloneDiscoveryService {
    identity: Arc<InstanceIdentity>,
    state: Mutex<DiscoveryState>,
}

impl StandaloneDiscoveryService {
    pub fn new(identity: InstanceIdentity) -> Self {
        Self {
            identity: Arc::new(identity),
            state: Mutex::new(DiscoveryState::Disconnected),
        }
    }
}

#[async_trait]
impl DiscoveryService for StandaloneDiscoveryService {
    async fn start(&self) -> Result<()> {
        info!("standalone discovery: {} runs without peers", self.identity);
        let mut state = self.state.lock();
        if *state != DiscoveryState::Terminal {
            *state = DiscoveryState::Published;
        }
        Ok(())
    }

    async fn publish_self(&self) -> Result<()> {
        Ok(())
    }

    async fn unpublish_self(&self) {}

    fn on_membership_change(
        &self,
        _listener: Arc<dyn MembershipListener>,
    ) {
    }

    fn peers(&self) -> Vec<InstanceIdentity> {
        Vec::new()
    }

    fn state(&self) -> DiscoveryState {
        *self.state.lock()
    }

    fn self_identity(&self) -> Arc<InstanceIdentity> {
        self.identity.clone()
    }

    async fn shutdown(&self) {
        *self.state.lock() = DiscoveryState::Terminal;
    }
}
