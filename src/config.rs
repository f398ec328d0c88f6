//! Agent configuration
//!
//! Values come from defaults, then an optional YAML file, then environment
//! variables, then command-line flags (applied by the binary).

use crate::engine::docker::DEFAULT_DOCKER_HOST;
use crate::engine::{ContainerEngine, DockerEngine, DockerEngineConfig, MemoryEngine};
use crate::error::{AgentError, Result};
use crate::service::DeploymentService;
use crate::store::FileStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable naming the engine endpoint
pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";
/// Environment variable with the registry username
pub const ENV_REGISTRY_USERNAME: &str = "DOCKER_USERNAME";
/// Environment variable with the registry password or token
pub const ENV_REGISTRY_TOKEN: &str = "DOCKER_TOKEN";
/// Environment variable overriding the data directory
pub const ENV_DATA_DIR: &str = "DEPLOY_AGENT_DATA_DIR";

/// Which container engine the agent drives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Docker Engine REST API
    #[default]
    Docker,
    /// In-process engine, nothing is actually run
    Memory,
}

impl std::str::FromStr for EngineKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(EngineKind::Docker),
            "memory" => Ok(EngineKind::Memory),
            other => Err(AgentError::Config(format!("unknown engine: {}", other))),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding the deployment store
    pub data_dir: PathBuf,
    /// Engine endpoint
    pub docker_host: String,
    /// Engine implementation
    pub engine: EngineKind,
    /// Registry username for image pulls
    pub registry_username: Option<String>,
    /// Registry password or token for image pulls
    pub registry_token: Option<String>,
    /// Grace period before a stopping container is killed
    pub stop_timeout_secs: u64,
    /// Timeout for engine calls other than pull and stop
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("deploy-agent"),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            engine: EngineKind::Docker,
            registry_username: None,
            registry_token: None,
            stop_timeout_secs: 60,
            request_timeout_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Defaults overlaid with YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = lookup(ENV_DOCKER_HOST) {
            self.docker_host = host;
        }
        if let Some(username) = lookup(ENV_REGISTRY_USERNAME) {
            self.registry_username = Some(username);
        }
        if let Some(token) = lookup(ENV_REGISTRY_TOKEN) {
            self.registry_token = Some(token);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Check values that cannot be caught by deserialization
    pub fn validate(&self) -> Result<()> {
        if self.stop_timeout_secs == 0 {
            return Err(AgentError::Config(
                "stop_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(AgentError::Config(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.registry_token.is_some() && self.registry_username.is_none() {
            return Err(AgentError::Config(
                "registry token given without a username".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory of the key-value store
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Stop timeout as a duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Settings for the Docker engine client
    pub fn docker_engine_config(&self) -> DockerEngineConfig {
        DockerEngineConfig {
            host: self.docker_host.clone(),
            registry_username: self.registry_username.clone(),
            registry_token: self.registry_token.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// Wire up the deployment service this configuration describes
    pub fn build_service(&self) -> Result<DeploymentService> {
        self.validate()?;

        let store = Arc::new(FileStore::new(self.store_dir())?);
        let engine: Arc<dyn ContainerEngine> = match self.engine {
            EngineKind::Docker => Arc::new(DockerEngine::new(self.docker_engine_config())?),
            EngineKind::Memory => Arc::new(MemoryEngine::new()),
        };

        Ok(DeploymentService::with_backends(store, engine).stop_timeout(self.stop_timeout()))
    }
}
