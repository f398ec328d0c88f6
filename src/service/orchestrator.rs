//! Deployment orchestration
//!
//! Create, stop and update walk a deployment's replicas one at a time and
//! persist the full snapshot after every replica that changes, so a failure
//! or crash loses at most the replica in flight. Nothing is retried or
//! rolled back: an aborted call leaves the last saved snapshot in place and
//! the caller repairs by invoking the same operation again. A tracked
//! container the engine no longer knows counts as already stopped and
//! removed, which is what lets a retry get past an earlier failure.
//! Mutating calls for one name are serialized through [`NameLocks`].

use super::locks::NameLocks;
use super::status::DeploymentStatus;
use crate::deployment::spec::{DEPLOYMENT_LABEL, PROVENANCE_LABEL, PROVENANCE_VALUE};
use crate::deployment::{
    ContainerDescriptor, ContainerSpec, Deployment, DeploymentConfig, DeploymentPhase,
    DeploymentRepository,
};
use crate::engine::{ContainerEngine, EngineDriver};
use crate::error::{AgentError, Result};
use crate::store::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period given to a container before it is killed
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Orchestrates deployments over a repository and an engine driver
#[derive(Clone)]
pub struct DeploymentService {
    repo: DeploymentRepository,
    driver: EngineDriver,
    locks: Arc<NameLocks>,
    stop_timeout: Duration,
}

impl DeploymentService {
    /// Create a service
    pub fn new(repo: DeploymentRepository, driver: EngineDriver) -> Self {
        Self {
            repo,
            driver,
            locks: Arc::new(NameLocks::new()),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Create a service directly over a store and an engine
    pub fn with_backends(store: Arc<dyn KvStore>, engine: Arc<dyn ContainerEngine>) -> Self {
        Self::new(DeploymentRepository::new(store), EngineDriver::new(engine))
    }

    /// Set the per-container stop timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Create a deployment and start its replicas
    pub async fn create(&self, config: DeploymentConfig) -> Result<Deployment> {
        config.validate()?;

        let name = config.name.clone();
        let _guard = self.locks.acquire(&name).await;

        let result = self.create_locked(config).await;
        if let Err(e) = &result {
            warn!("Create of deployment {} aborted: {}", name, e);
        }
        result
    }

    async fn create_locked(&self, config: DeploymentConfig) -> Result<Deployment> {
        match self.repo.get(&config.name).await {
            Ok(_) => return Err(AgentError::Conflict(config.name)),
            Err(AgentError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // Intent is persisted before the engine is touched
        let mut deployment = Deployment::new(config);
        self.repo.save(&deployment).await?;

        info!(
            "Creating deployment {} with {} replicas of {}",
            deployment.name, deployment.config.replicas, deployment.config.image
        );

        for index in 0..deployment.config.replicas {
            let spec = ContainerSpec::for_replica(&deployment.config, index)?;
            let descriptor = self.driver.deploy(&spec).await?;

            deployment.track(descriptor);
            self.repo.save(&deployment).await?;
        }

        deployment.set_phase(DeploymentPhase::Running);
        self.repo.save(&deployment).await?;

        info!("Deployment {} created", deployment.name);
        Ok(deployment)
    }

    /// Stop and remove every replica, then delete the record
    pub async fn stop(&self, name: &str) -> Result<()> {
        let _guard = self.locks.acquire(name).await;

        let result = self.stop_locked(name).await;
        if let Err(e) = &result {
            warn!("Stop of deployment {} aborted: {}", name, e);
        }
        result
    }

    async fn stop_locked(&self, name: &str) -> Result<()> {
        let mut deployment = self.repo.get(name).await?;

        if deployment.running_count() > 0 {
            deployment.set_phase(DeploymentPhase::Stopping);
            self.repo.save(&deployment).await?;
        }

        info!(
            "Stopping deployment {} ({} replicas)",
            name,
            deployment.running_count()
        );

        for live in deployment.replicas() {
            self.retire(name, &live).await?;

            deployment.untrack(&live.id);
            self.repo.save(&deployment).await?;
            info!("Removed replica {} ({}) of {}", live.name, live.id, name);
        }

        self.repo.delete(name).await?;
        info!("Deployment {} stopped", name);
        Ok(())
    }

    /// Replace every replica with one running `image`
    pub async fn update(&self, name: &str, image: &str) -> Result<Deployment> {
        if name.is_empty() {
            return Err(AgentError::NotFound(name.to_string()));
        }
        if image.trim().is_empty() {
            return Err(AgentError::Validation("image must not be empty".to_string()));
        }

        let _guard = self.locks.acquire(name).await;

        let result = self.update_locked(name, image).await;
        if let Err(e) = &result {
            warn!("Update of deployment {} aborted: {}", name, e);
        }
        result
    }

    async fn update_locked(&self, name: &str, image: &str) -> Result<Deployment> {
        let mut deployment = self.repo.get(name).await?;

        deployment.config.image = image.to_string();
        deployment.set_phase(DeploymentPhase::Updating);
        self.repo.save(&deployment).await?;

        info!(
            "Updating deployment {} to {} ({} replicas)",
            name,
            image,
            deployment.running_count()
        );

        for live in deployment.replicas() {
            self.retire(name, &live).await?;

            // Same name and host port as the container being replaced
            let spec = ContainerSpec::replacement(&deployment.config, &live, image);
            let replacement = self.driver.deploy(&spec).await?;

            info!(
                "Replaced replica {} of {}: {} -> {}",
                live.name, name, live.id, replacement.id
            );
            deployment.untrack(&live.id);
            deployment.track(replacement);
            self.repo.save(&deployment).await?;
        }

        deployment.set_phase(DeploymentPhase::Running);
        self.repo.save(&deployment).await?;

        info!("Deployment {} updated", name);
        Ok(deployment)
    }

    /// Stop and remove one tracked container
    async fn retire(&self, name: &str, live: &ContainerDescriptor) -> Result<()> {
        let result = match self.driver.stop(&live.id, self.stop_timeout).await {
            Ok(()) => self.driver.remove(&live.id).await,
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.is_missing_container() => {
                warn!(
                    "Replica {} ({}) of {} is already gone from the engine",
                    live.name, live.id, name
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Load a deployment
    pub async fn get(&self, name: &str) -> Result<Deployment> {
        self.repo.get(name).await
    }

    /// All deployments, ascending by name
    pub async fn list(&self) -> Result<Vec<Deployment>> {
        self.repo.list().await
    }

    /// Compare a deployment's running set with the engine
    pub async fn status(&self, name: &str) -> Result<DeploymentStatus> {
        let deployment = self.repo.get(name).await?;

        let mut labels = HashMap::new();
        labels.insert(PROVENANCE_LABEL.to_string(), PROVENANCE_VALUE.to_string());
        labels.insert(DEPLOYMENT_LABEL.to_string(), name.to_string());
        let live = self.driver.list(&labels).await?;

        Ok(DeploymentStatus::reconcile(
            &deployment.name,
            deployment.phase,
            deployment.config.replicas,
            deployment.running.values(),
            live,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::Protocol;
    use crate::engine::{EngineOp, MemoryEngine};
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct Harness {
        engine: Arc<MemoryEngine>,
        service: DeploymentService,
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(MemoryStore::new()))
    }

    fn harness_with_store(store: Arc<dyn KvStore>) -> Harness {
        let engine = Arc::new(MemoryEngine::new());
        let service = DeploymentService::with_backends(store, engine.clone())
            .stop_timeout(Duration::from_secs(1));
        Harness { engine, service }
    }

    /// Memory store that can fail a chosen upcoming put
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        puts: tokio::sync::Mutex<(usize, HashSet<usize>)>,
    }

    impl FlakyStore {
        /// Make the `nth` upcoming put fail (1 = the next put)
        async fn fail_put(&self, nth: usize) {
            let mut puts = self.puts.lock().await;
            let next = puts.0 + nth;
            puts.1.insert(next);
        }
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(collection, key).await
        }

        async fn put(&self, collection: &str, key: &str, value: &[u8]) -> Result<()> {
            {
                let mut puts = self.puts.lock().await;
                puts.0 += 1;
                let n = puts.0;
                if puts.1.remove(&n) {
                    return Err(AgentError::Persistence(format!("injected put failure (call {})", n)));
                }
            }
            self.inner.put(collection, key, value).await
        }

        async fn delete(&self, collection: &str, key: &str) -> Result<()> {
            self.inner.delete(collection, key).await
        }

        async fn keys(&self, collection: &str) -> Result<Vec<String>> {
            self.inner.keys(collection).await
        }
    }

    fn config(name: &str, replicas: u32) -> DeploymentConfig {
        DeploymentConfig::new(name, "nginx:1.25")
            .replicas(replicas)
            .container_port(80, Protocol::Tcp)
            .host_ports("0.0.0.0", 8080, Protocol::Tcp)
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config_before_io() {
        let h = harness();
        let err = h.service.create(config("", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.engine.total_calls().await, 0);
        assert!(h.service.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_keeps_prior_replicas() {
        let h = harness();
        h.engine.fail_on(EngineOp::Create, 3).await;

        let err = h.service.create(config("web", 4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);

        let stored = h.service.get("web").await.unwrap();
        assert_eq!(stored.running_count(), 2);
        assert_eq!(stored.phase, DeploymentPhase::Creating);

        let ports: Vec<u16> = stored.replicas().iter().map(|d| d.host.port).collect();
        assert_eq!(ports, vec![8080, 8081]);

        // No replica four was attempted
        assert_eq!(h.engine.calls(EngineOp::Create).await, 3);
    }

    #[tokio::test]
    async fn test_create_with_zero_replicas() {
        let h = harness();
        let deployment = h.service.create(config("idle", 0)).await.unwrap();
        assert_eq!(deployment.running_count(), 0);
        assert_eq!(deployment.phase, DeploymentPhase::Running);
        assert_eq!(h.engine.total_calls().await, 0);

        h.service.stop("idle").await.unwrap();
        assert_eq!(h.service.get("idle").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_stop_failure_is_resumable() {
        let h = harness();
        h.service.create(config("web", 3)).await.unwrap();

        h.engine.fail_on(EngineOp::Remove, 2).await;
        let err = h.service.stop("web").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);

        let stored = h.service.get("web").await.unwrap();
        assert_eq!(stored.running_count(), 2);
        assert_eq!(stored.phase, DeploymentPhase::Stopping);

        // The failed replica was stopped but not removed; stopping again is fine
        h.service.stop("web").await.unwrap();
        assert_eq!(h.service.get("web").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.engine.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_walks_ascending_ids() {
        let h = harness();
        let created = h.service.create(config("web", 3)).await.unwrap();
        let first_id = created.replicas()[0].id.clone();

        h.engine.fail_on(EngineOp::Stop, 2).await;
        assert!(h.service.stop("web").await.is_err());

        let stored = h.service.get("web").await.unwrap();
        assert!(!stored.running.contains_key(&first_id));
        assert_eq!(stored.running_count(), 2);
    }

    #[tokio::test]
    async fn test_update_persists_new_image() {
        let h = harness();
        h.service.create(config("web", 2)).await.unwrap();

        let updated = h.service.update("web", "nginx:1.27").await.unwrap();
        assert_eq!(updated.config.image, "nginx:1.27");
        assert_eq!(updated.phase, DeploymentPhase::Running);
        assert!(updated.replicas().iter().all(|d| d.image == "nginx:1.27"));

        let names: Vec<String> = updated.replicas().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["web-1", "web-2"]);

        assert_eq!(h.service.get("web").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_update_failure_is_repaired_by_retry() {
        let h = harness();
        let created = h.service.create(config("web", 2)).await.unwrap();
        let ids: Vec<String> = created.running.keys().cloned().collect();

        // The first replacement's pull fails after its predecessor is removed
        h.engine.fail_on(EngineOp::Pull, 1).await;
        let err = h.service.update("web", "nginx:1.27").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);

        let stored = h.service.get("web").await.unwrap();
        assert_eq!(stored.phase, DeploymentPhase::Updating);
        assert_eq!(stored.config.image, "nginx:1.27");
        let stored_ids: Vec<String> = stored.running.keys().cloned().collect();
        assert_eq!(stored_ids, ids);

        let status = h.service.status("web").await.unwrap();
        assert_eq!(status.missing().len(), 1);
        assert_eq!(status.missing()[0].id, ids[0]);

        // The removed entry is skipped and replaced from its descriptor
        let repaired = h.service.update("web", "nginx:1.27").await.unwrap();
        assert_eq!(repaired.phase, DeploymentPhase::Running);
        assert_eq!(repaired.running_count(), 2);
        assert!(repaired.running.keys().all(|id| !ids.contains(id)));

        let names: Vec<String> = repaired.replicas().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["web-1", "web-2"]);
        assert!(h.service.status("web").await.unwrap().is_consistent());
        assert_eq!(h.engine.container_count().await, 2);
    }

    #[tokio::test]
    async fn test_stop_drops_entries_missing_from_engine() {
        let h = harness();
        let created = h.service.create(config("web", 2)).await.unwrap();

        // Removed behind the agent's back
        let first = created.replicas()[0].id.clone();
        h.engine.remove_container(&first, true).await.unwrap();

        h.service.stop("web").await.unwrap();
        assert_eq!(h.service.get("web").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.engine.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_aborts_on_failed_save() {
        let store = Arc::new(FlakyStore::default());
        let h = harness_with_store(store.clone());

        // Intent, replica one, then replica two's save fails
        store.fail_put(3).await;
        let err = h.service.create(config("web", 3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);

        // Replica three was never attempted
        assert_eq!(h.engine.calls(EngineOp::Create).await, 2);

        let stored = h.service.get("web").await.unwrap();
        assert_eq!(stored.running_count(), 1);
        assert_eq!(stored.phase, DeploymentPhase::Creating);

        // The replica whose save failed is live but untracked
        let status = h.service.status("web").await.unwrap();
        assert_eq!(status.untracked.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_aborts_on_failed_save() {
        let store = Arc::new(FlakyStore::default());
        let h = harness_with_store(store.clone());
        h.service.create(config("web", 3)).await.unwrap();

        // Phase change, then the first untrack's save fails
        store.fail_put(2).await;
        let err = h.service.stop("web").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert_eq!(h.engine.calls(EngineOp::Stop).await, 1);

        let stored = h.service.get("web").await.unwrap();
        assert_eq!(stored.running_count(), 3);
        assert_eq!(stored.phase, DeploymentPhase::Stopping);

        h.service.stop("web").await.unwrap();
        assert_eq!(h.service.get("web").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.engine.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_empty_name_is_not_found() {
        let h = harness();
        let err = h.service.update("", "nginx:2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(h.engine.total_calls().await, 0);
    }

    #[tokio::test]
    async fn test_status_reports_untracked() {
        let h = harness();
        h.service.create(config("web", 1)).await.unwrap();

        // A container carrying the deployment's labels, started behind our back
        let stray = DeploymentConfig::new("web", "nginx:1.25")
            .replicas(1)
            .container_port(80, Protocol::Tcp)
            .host_ports("0.0.0.0", 9090, Protocol::Tcp);
        let mut spec = ContainerSpec::for_replica(&stray, 0).unwrap();
        spec.name = "web-stray".to_string();
        h.engine.create_container(&spec).await.unwrap();

        let status = h.service.status("web").await.unwrap();
        assert_eq!(status.running(), 1);
        assert_eq!(status.untracked.len(), 1);
        assert_eq!(status.untracked[0].name, "web-stray");
        assert!(!status.is_consistent());
    }

    #[tokio::test]
    async fn test_concurrent_create_same_name() {
        let h = harness();
        let a = {
            let service = h.service.clone();
            tokio::spawn(async move { service.create(config("web", 2)).await })
        };
        let b = {
            let service = h.service.clone();
            tokio::spawn(async move { service.create(config("web", 2)).await })
        };

        let results = vec![a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Conflict))
            .count();
        assert_eq!((ok, conflicts), (1, 1));
        assert_eq!(h.engine.container_count().await, 2);
    }
}
