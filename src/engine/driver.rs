//! Engine driver
//!
//! Wraps a [`ContainerEngine`] with the operations deployments are built
//! from. `deploy` is all-or-nothing from the caller's point of view: when a
//! container was created but could not be started, it is force-removed
//! before the error is returned, so no failed replica is left behind.

use super::{ContainerEngine, ContainerInfo};
use crate::deployment::{ContainerDescriptor, ContainerSpec, HostBinding};
use crate::error::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deployment-level view of a container engine
#[derive(Clone)]
pub struct EngineDriver {
    engine: Arc<dyn ContainerEngine>,
}

impl EngineDriver {
    /// Create a driver over an engine
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Pull the image, create and start a container for `spec`
    pub async fn deploy(&self, spec: &ContainerSpec) -> Result<ContainerDescriptor> {
        info!("Pulling image {}", spec.image);
        self.engine.pull_image(&spec.image).await?;

        let created = self.engine.create_container(spec).await?;
        debug!("Created container {} ({})", spec.name, created.id);

        if let Err(e) = self.engine.start_container(&created.id).await {
            warn!("Failed to start container {}: {}", created.id, e);
            if let Err(cleanup) = self.engine.remove_container(&created.id, true).await {
                warn!("Failed to clean up container {}: {}", created.id, cleanup);
            }
            return Err(e);
        }

        // The container is running at this point; a failed inspect only
        // costs us the resolved binding, not the replica.
        let (host, created_at) = match self.engine.inspect_container(&created.id).await {
            Ok(info) => (
                resolved_binding(&info, spec).unwrap_or_else(|| spec.host.clone()),
                info.created_at,
            ),
            Err(e) => {
                warn!("Failed to inspect container {}: {}", created.id, e);
                (spec.host.clone(), Utc::now())
            }
        };

        info!(
            "Started container {} ({}) on {}:{}",
            spec.name, created.id, host.ip, host.port
        );

        Ok(ContainerDescriptor {
            id: created.id,
            name: spec.name.clone(),
            image: spec.image.clone(),
            host,
            container: spec.container.clone(),
            created_at,
            warnings: created.warnings,
        })
    }

    /// Stop a container, allowing `timeout` for graceful shutdown
    pub async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        debug!("Stopping container {} (timeout {:?})", id, timeout);
        self.engine.stop_container(id, timeout).await
    }

    /// Remove a stopped container
    pub async fn remove(&self, id: &str) -> Result<()> {
        debug!("Removing container {}", id);
        self.engine.remove_container(id, false).await
    }

    /// Inspect a container
    pub async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        self.engine.inspect_container(id).await
    }

    /// List containers carrying all of `labels`
    pub async fn list(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerInfo>> {
        self.engine.list_containers(labels).await
    }
}

/// Host binding the engine reports for the spec's container port
fn resolved_binding(info: &ContainerInfo, spec: &ContainerSpec) -> Option<HostBinding> {
    info.ports
        .iter()
        .find(|p| {
            p.container_port == spec.container.port
                && p.proto == spec.container.proto
                && p.host_port.is_some()
        })
        .and_then(|p| {
            Some(HostBinding {
                ip: p.host_ip.clone().unwrap_or_else(|| spec.host.ip.clone()),
                port: p.host_port?,
                proto: spec.host.proto,
            })
        })
}
