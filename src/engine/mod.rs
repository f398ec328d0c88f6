//! Container engine access
//!
//! [`ContainerEngine`] is the raw per-call contract against a container
//! engine. [`EngineDriver`] composes those calls into the operations the
//! deployment service uses, most importantly `deploy` (pull, create, start).

pub mod docker;
pub mod driver;
pub mod memory;

pub use docker::{DockerEngine, DockerEngineConfig};
pub use driver::EngineDriver;
pub use memory::{EngineOp, MemoryEngine};

use crate::deployment::{ContainerSpec, Protocol};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Result of a container create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    /// Engine-assigned ID
    pub id: String,
    /// Warnings reported by the engine
    pub warnings: Vec<String>,
}

/// Published port as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Host IP, if bound
    pub host_ip: Option<String>,
    /// Host port, if bound
    pub host_port: Option<u16>,
    /// Container port
    pub container_port: u16,
    /// Protocol
    pub proto: Protocol,
}

/// Container state as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container ID
    pub id: String,
    /// Container name without the leading slash
    pub name: String,
    /// Image reference
    pub image: String,
    /// Engine state, e.g. `running` or `exited`
    pub state: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Published ports
    pub ports: Vec<PortInfo>,
}

impl ContainerInfo {
    /// Whether the engine reports the container as running
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Raw container engine operations, one remote call each
///
/// Calls naming a container ID fail with [`AgentError::NoSuchContainer`]
/// when the engine does not know it.
///
/// [`AgentError::NoSuchContainer`]: crate::error::AgentError::NoSuchContainer
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull an image so it is available locally
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container
    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreatedContainer>;

    /// Start a created container
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, killing it after `timeout`
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Remove a container
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Inspect one container
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// List containers (running or not) carrying all of `labels`
    async fn list_containers(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerInfo>>;
}
