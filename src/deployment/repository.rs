//! Deployment repository
//!
//! Whole-snapshot persistence of deployments, one record per name in the
//! `Deployments` collection.

use super::model::Deployment;
use crate::error::{AgentError, Result};
use crate::store::KvStore;
use std::sync::Arc;
use tracing::debug;

/// Collection holding deployment records
pub const DEPLOYMENTS_COLLECTION: &str = "Deployments";

/// Repository of deployment snapshots
#[derive(Clone)]
pub struct DeploymentRepository {
    store: Arc<dyn KvStore>,
}

impl DeploymentRepository {
    /// Create a repository over a store
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Load a deployment by name
    pub async fn get(&self, name: &str) -> Result<Deployment> {
        let bytes = self
            .store
            .get(DEPLOYMENTS_COLLECTION, name)
            .await?
            .ok_or_else(|| AgentError::NotFound(name.to_string()))?;

        serde_json::from_slice(&bytes).map_err(|e| {
            AgentError::Persistence(format!("corrupt record for {}: {}", name, e))
        })
    }

    /// Overwrite the stored snapshot
    pub async fn save(&self, deployment: &Deployment) -> Result<()> {
        if deployment.name.is_empty() {
            return Err(AgentError::Validation("name must not be empty".to_string()));
        }

        let encoded = serde_json::to_vec(deployment).map_err(|e| {
            AgentError::Persistence(format!("failed to encode {}: {}", deployment.name, e))
        })?;
        self.store
            .put(DEPLOYMENTS_COLLECTION, &deployment.name, &encoded)
            .await?;

        debug!(
            "Saved deployment {} ({} running)",
            deployment.name,
            deployment.running_count()
        );
        Ok(())
    }

    /// Remove the record; absent records are ignored
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(DEPLOYMENTS_COLLECTION, name).await?;
        debug!("Deleted deployment record {}", name);
        Ok(())
    }

    /// All stored deployments, ascending by name
    pub async fn list(&self) -> Result<Vec<Deployment>> {
        let mut deployments = Vec::new();
        for name in self.store.keys(DEPLOYMENTS_COLLECTION).await? {
            match self.get(&name).await {
                Ok(d) => deployments.push(d),
                // Deleted between listing and reading
                Err(AgentError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(deployments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::config::{DeploymentConfig, Protocol};
    use crate::deployment::model::{
        ContainerBinding, ContainerDescriptor, DeploymentPhase, HostBinding,
    };
    use crate::error::ErrorKind;
    use crate::store::{FileStore, MemoryStore};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample() -> Deployment {
        let config = DeploymentConfig::new("web", "nginx:1.25")
            .replicas(1)
            .container_port(80, Protocol::Tcp)
            .host_ports("0.0.0.0", 8080, Protocol::Tcp)
            .label("team", "edge");
        let mut deployment = Deployment::new(config);
        deployment.track(ContainerDescriptor {
            id: "4f2a".to_string(),
            name: "web-1".to_string(),
            image: "nginx:1.25".to_string(),
            host: HostBinding {
                ip: "0.0.0.0".to_string(),
                port: 8080,
                proto: Protocol::Tcp,
            },
            container: ContainerBinding {
                port: 80,
                proto: Protocol::Tcp,
            },
            created_at: Utc::now(),
            warnings: vec!["memory limit ignored".to_string()],
        });
        deployment.set_phase(DeploymentPhase::Running);
        deployment
    }

    #[tokio::test]
    async fn test_save_get_roundtrip() {
        let temp = tempdir().unwrap();
        let repo = DeploymentRepository::new(Arc::new(FileStore::new(temp.path().to_path_buf()).unwrap()));

        let deployment = sample();
        repo.save(&deployment).await.unwrap();
        assert_eq!(repo.get("web").await.unwrap(), deployment);
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let repo = DeploymentRepository::new(Arc::new(MemoryStore::new()));
        let err = repo.get("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // Deleting an absent record is fine
        repo.delete("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let store = Arc::new(MemoryStore::new());
        store.put(DEPLOYMENTS_COLLECTION, "web", b"not json").await.unwrap();

        let repo = DeploymentRepository::new(store);
        let err = repo.get("web").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let repo = DeploymentRepository::new(Arc::new(MemoryStore::new()));
        repo.save(&Deployment::new(DeploymentConfig::new("zeta", "redis"))).await.unwrap();
        repo.save(&Deployment::new(DeploymentConfig::new("alpha", "redis"))).await.unwrap();

        let names: Vec<String> = repo.list().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
