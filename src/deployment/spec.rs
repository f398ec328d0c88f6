//! Per-replica container specs

use super::config::DeploymentConfig;
use super::model::{ContainerBinding, ContainerDescriptor, HostBinding};
use crate::error::Result;
use std::collections::HashMap;

/// Provenance label key set on every managed container
pub const PROVENANCE_LABEL: &str = "by";
/// Provenance label value
pub const PROVENANCE_VALUE: &str = "deploy-agent";
/// Label carrying the owning deployment name
pub const DEPLOYMENT_LABEL: &str = "deploy-agent.deployment";

/// Everything the engine needs to run one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Container name
    pub name: String,
    /// Container port
    pub container: ContainerBinding,
    /// Host binding
    pub host: HostBinding,
    /// Command arguments
    pub command: Vec<String>,
    /// Labels
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Spec for replica `index` (0-based) of a freshly created deployment
    pub fn for_replica(config: &DeploymentConfig, index: u32) -> Result<Self> {
        let host_port = config.host_port_for(index)?;

        Ok(Self {
            image: config.image.clone(),
            name: format!("{}-{}", config.name, index + 1),
            container: ContainerBinding {
                port: config.container_net.port,
                proto: config.container_net.proto,
            },
            host: HostBinding {
                ip: config.host_net.ip.clone(),
                port: host_port,
                proto: config.host_net.proto,
            },
            command: config.command.clone(),
            labels: managed_labels(config),
        })
    }

    /// Spec replacing a live replica with `image`, keeping its name and bound host port
    pub fn replacement(config: &DeploymentConfig, live: &ContainerDescriptor, image: &str) -> Self {
        Self {
            image: image.to_string(),
            name: live.name.clone(),
            container: live.container.clone(),
            host: live.host.clone(),
            command: config.command.clone(),
            labels: managed_labels(config),
        }
    }

    /// Engine port key, e.g. `80/tcp`
    pub fn container_port_key(&self) -> String {
        format!("{}/{}", self.container.port, self.container.proto)
    }
}

/// Labels applied to every container of a deployment
pub fn managed_labels(config: &DeploymentConfig) -> HashMap<String, String> {
    let mut labels = config.labels.clone();
    labels.insert(PROVENANCE_LABEL.to_string(), PROVENANCE_VALUE.to_string());
    labels.insert(DEPLOYMENT_LABEL.to_string(), config.name.clone());
    labels
}
