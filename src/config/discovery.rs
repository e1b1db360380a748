use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::constants::DEFAULT_REGISTRY_PATH;
use crate::Result;

/// Which discovery variant the node runs with. Chosen once at startup.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryBackend {
    /// Single instance, no registry
    #[default]
    Standalone,
    /// Registry-backed discovery
    Registry,
}

/// Membership registry connection settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub backend: DiscoveryBackend,

    /// Registry connection string
    #[serde(default = "default_url")]
    pub url: String,

    /// Upper bound for establishing a registry session
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Session lifetime without heartbeats before the registry drops our ephemeral record
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Fixed pause between reconnect attempts; retried indefinitely
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Parent directory of the membership records
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: DiscoveryBackend::default(),
            url: default_url(),
            connection_timeout_ms: default_connection_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            registry_path: default_registry_path(),
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == DiscoveryBackend::Standalone {
            return Ok(());
        }

        if self.url.trim().is_empty() {
            return Err(invalid("discovery.url cannot be empty"));
        }

        if self.connection_timeout_ms == 0 {
            return Err(invalid("discovery.connection_timeout_ms must be > 0"));
        }

        if self.session_timeout_ms == 0 {
            return Err(invalid("discovery.session_timeout_ms must be > 0"));
        }

        if self.retry_interval_ms == 0 {
            return Err(invalid("discovery.retry_interval_ms must be > 0"));
        }

        if !self.registry_path.starts_with('/') || self.registry_path.len() < 2 {
            return Err(invalid(format!(
                "discovery.registry_path {} must be an absolute, non-root path",
                self.registry_path
            )));
        }

        if self.registry_path.ends_with('/') {
            return Err(invalid(format!(
                "discovery.registry_path {} must not end with '/'",
                self.registry_path
            )));
        }

        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_url() -> String {
    "embedded://fleet".to_string()
}
fn default_connection_timeout_ms() -> u64 {
    3000
}
fn default_session_timeout_ms() -> u64 {
    3000
}
fn default_retry_interval_ms() -> u64 {
    3000
}
fn default_registry_path() -> String {
    DEFAULT_REGISTRY_PATH.to_string()
}
