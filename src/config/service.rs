use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use super::validate_directory;
use crate::Result;
use crate::ServiceRole;
use crate::TenantId;

/// Identity of the local instance as advertised to its peers
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Stable name of this service; survives restarts, unlike the registry record
    #[serde(default = "default_service_id")]
    pub service_id: String,

    /// Host peers use to reach this instance
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Roles this instance serves
    #[serde(default = "default_roles")]
    pub roles: Vec<ServiceRole>,

    /// Present only on instances dedicated to a single tenant
    #[serde(default)]
    pub tenant_id: Option<TenantId>,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            host: default_host(),
            port: default_port(),
            roles: default_roles(),
            tenant_id: None,
            log_dir: default_log_dir(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.service_id.trim().is_empty() {
            return Err(invalid("service_id cannot be empty"));
        }

        if self.host.trim().is_empty() {
            return Err(invalid("host cannot be empty"));
        }

        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        if self.roles.is_empty() {
            return Err(invalid("at least one service role is required"));
        }

        validate_directory(&self.log_dir, "log_dir")?;

        Ok(())
    }
}

fn default_service_id() -> String {
    format!("fleet-{}", nanoid::nanoid!(10))
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9001
}
fn default_roles() -> Vec<ServiceRole> {
    vec![ServiceRole::Core, ServiceRole::RuleEngine]
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/fleet/logs")
}
