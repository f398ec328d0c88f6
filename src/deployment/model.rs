//! Deployment aggregate and per-replica descriptors

use super::config::{DeploymentConfig, Protocol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle phase recorded with every persisted snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPhase {
    /// Replicas are being created
    Creating,
    /// Last operation completed
    Running,
    /// Replicas are being swapped to a new image
    Updating,
    /// Replicas are being torn down
    Stopping,
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentPhase::Creating => write!(f, "creating"),
            DeploymentPhase::Running => write!(f, "running"),
            DeploymentPhase::Updating => write!(f, "updating"),
            DeploymentPhase::Stopping => write!(f, "stopping"),
        }
    }
}

/// Host side of a resolved port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBinding {
    pub ip: String,
    pub port: u16,
    pub proto: Protocol,
}

/// Container side of a resolved port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerBinding {
    pub port: u16,
    pub proto: Protocol,
}

/// One live replica as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDescriptor {
    /// Engine-assigned container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Image the container runs
    pub image: String,
    /// Host binding actually in effect
    pub host: HostBinding,
    /// Container port
    pub container: ContainerBinding,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Engine warnings returned on create
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Deployment aggregate: config plus the running set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Deployment name
    pub name: String,
    /// Configuration
    pub config: DeploymentConfig,
    /// Live replicas keyed by container ID, iterated in ascending ID order
    pub running: BTreeMap<String, ContainerDescriptor>,
    /// Phase of the last operation
    pub phase: DeploymentPhase,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last persisted change
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a deployment with an empty running set
    pub fn new(config: DeploymentConfig) -> Self {
        let now = Utc::now();
        Self {
            name: config.name.clone(),
            config,
            running: BTreeMap::new(),
            phase: DeploymentPhase::Creating,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a started replica
    pub fn track(&mut self, descriptor: ContainerDescriptor) {
        self.running.insert(descriptor.id.clone(), descriptor);
        self.touch();
    }

    /// Forget a removed replica
    pub fn untrack(&mut self, id: &str) -> Option<ContainerDescriptor> {
        let removed = self.running.remove(id);
        self.touch();
        removed
    }

    /// Set the phase
    pub fn set_phase(&mut self, phase: DeploymentPhase) {
        self.phase = phase;
        self.touch();
    }

    /// Running set snapshot in iteration order
    pub fn replicas(&self) -> Vec<ContainerDescriptor> {
        self.running.values().cloned().collect()
    }

    /// Number of live replicas
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
