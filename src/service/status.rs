//! Reconciliation view of a deployment

use crate::deployment::{ContainerDescriptor, DeploymentPhase};
use crate::engine::ContainerInfo;
use serde::Serialize;
use std::collections::HashMap;

/// A tracked replica and what the engine says about it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Image recorded for the replica
    pub image: String,
    /// Host port recorded for the replica
    pub host_port: u16,
    /// Engine state, `None` if the engine no longer has the container
    pub engine_state: Option<String>,
}

impl ReplicaStatus {
    /// Whether the engine still knows the container
    pub fn is_present(&self) -> bool {
        self.engine_state.is_some()
    }
}

/// Persisted running set compared with the engine's view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Deployment name
    pub name: String,
    /// Phase of the last operation
    pub phase: DeploymentPhase,
    /// Replica count asked for at creation
    pub desired_replicas: u32,
    /// Tracked replicas in running-set order
    pub replicas: Vec<ReplicaStatus>,
    /// Containers labelled for the deployment but not tracked by it
    pub untracked: Vec<ContainerInfo>,
}

impl DeploymentStatus {
    /// Build the view from the running set and the engine listing
    pub fn reconcile<'a>(
        name: &str,
        phase: DeploymentPhase,
        desired_replicas: u32,
        tracked: impl IntoIterator<Item = &'a ContainerDescriptor>,
        live: Vec<ContainerInfo>,
    ) -> Self {
        let mut live: HashMap<String, ContainerInfo> =
            live.into_iter().map(|c| (c.id.clone(), c)).collect();

        let replicas = tracked
            .into_iter()
            .map(|d| ReplicaStatus {
                id: d.id.clone(),
                name: d.name.clone(),
                image: d.image.clone(),
                host_port: d.host.port,
                engine_state: live.remove(&d.id).map(|c| c.state),
            })
            .collect();

        let mut untracked: Vec<ContainerInfo> = live.into_values().collect();
        untracked.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            name: name.to_string(),
            phase,
            desired_replicas,
            replicas,
            untracked,
        }
    }

    /// Tracked replicas the engine no longer has
    pub fn missing(&self) -> Vec<&ReplicaStatus> {
        self.replicas.iter().filter(|r| !r.is_present()).collect()
    }

    /// Tracked replicas the engine reports as running
    pub fn running(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.engine_state.as_deref() == Some("running"))
            .count()
    }

    /// Whether the running set and the engine agree
    pub fn is_consistent(&self) -> bool {
        self.untracked.is_empty() && self.replicas.iter().all(ReplicaStatus::is_present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{ContainerBinding, HostBinding, Protocol};
    use chrono::Utc;

    fn descriptor(id: &str, port: u16) -> ContainerDescriptor {
        ContainerDescriptor {
            id: id.to_string(),
            name: format!("web-{}", port - 8079),
            image: "nginx:1.25".to_string(),
            host: HostBinding {
                ip: "0.0.0.0".to_string(),
                port,
                proto: Protocol::Tcp,
            },
            container: ContainerBinding {
                port: 80,
                proto: Protocol::Tcp,
            },
            created_at: Utc::now(),
            warnings: Vec::new(),
        }
    }

    fn info(id: &str, state: &str) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            name: id.to_string(),
            image: "nginx:1.25".to_string(),
            state: state.to_string(),
            created_at: Utc::now(),
            labels: HashMap::new(),
            ports: Vec::new(),
        }
    }

    #[test]
    fn test_reconcile() {
        let tracked = vec![descriptor("a", 8080), descriptor("b", 8081), descriptor("c", 8082)];
        let live = vec![info("a", "running"), info("c", "exited"), info("z", "running")];

        let status = DeploymentStatus::reconcile("web", DeploymentPhase::Running, 3, &tracked, live);

        assert_eq!(status.replicas.len(), 3);
        assert_eq!(status.running(), 1);
        assert_eq!(status.missing().len(), 1);
        assert_eq!(status.missing()[0].id, "b");
        assert_eq!(status.untracked.len(), 1);
        assert_eq!(status.untracked[0].id, "z");
        assert!(!status.is_consistent());
    }

    #[test]
    fn test_consistent() {
        let tracked = vec![descriptor("a", 8080)];
        let status = DeploymentStatus::reconcile(
            "web",
            DeploymentPhase::Running,
            1,
            &tracked,
            vec![info("a", "running")],
        );
        assert!(status.is_consistent());
    }
}
