//! In-process container engine
//!
//! Keeps containers in memory and mimics the engine behaviour the agent
//! relies on: unique container names, exclusive host ports among running
//! containers, and errors for unknown IDs. Any operation can be made to
//! fail on its n-th call, which is how partial failures are exercised.

use super::{ContainerEngine, ContainerInfo, CreatedContainer, PortInfo};
use crate::deployment::ContainerSpec;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// First port handed out when a spec asks for an ephemeral host port
const EPHEMERAL_PORT_BASE: u16 = 32768;

/// Engine operations, for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    List,
}

#[derive(Default)]
struct EngineState {
    containers: BTreeMap<String, ContainerInfo>,
    images: Vec<String>,
    calls: HashMap<EngineOp, usize>,
    failures: HashMap<EngineOp, HashSet<usize>>,
    sequence: u64,
}

impl EngineState {
    /// Count a call and report whether it was scheduled to fail
    fn record(&mut self, op: EngineOp) -> Result<()> {
        let count = self.calls.entry(op).or_insert(0);
        *count += 1;
        let n = *count;

        if self.failures.get_mut(&op).is_some_and(|f| f.remove(&n)) {
            return Err(AgentError::Engine(format!("injected {:?} failure (call {})", op, n)));
        }
        Ok(())
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut ContainerInfo> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| AgentError::NoSuchContainer(id.to_string()))
    }
}

/// Container engine living entirely in process memory
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` upcoming call of `op` fail (1 = the next call)
    pub async fn fail_on(&self, op: EngineOp, nth: usize) {
        let mut state = self.state.lock().await;
        let base = state.calls.get(&op).copied().unwrap_or(0);
        state.failures.entry(op).or_default().insert(base + nth);
    }

    /// Number of calls made for `op`
    pub async fn calls(&self, op: EngineOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Total calls across all operations
    pub async fn total_calls(&self) -> usize {
        self.state.lock().await.calls.values().sum()
    }

    /// Number of containers the engine knows about
    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    /// Images pulled so far, in pull order
    pub async fn pulled_images(&self) -> Vec<String> {
        self.state.lock().await.images.clone()
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(EngineOp::Pull)?;
        state.images.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        let mut state = self.state.lock().await;
        state.record(EngineOp::Create)?;

        if !state.images.contains(&spec.image) {
            return Err(AgentError::Engine(format!("No such image: {}", spec.image)));
        }

        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(AgentError::Engine(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        state.sequence += 1;
        let host_port = if spec.host.port == 0 {
            let offset = u16::try_from(state.sequence).unwrap_or(u16::MAX);
            EPHEMERAL_PORT_BASE.saturating_add(offset)
        } else {
            spec.host.port
        };

        // Fixed-width sequence prefix keeps IDs ascending in creation order
        let id = format!("{:016x}{}", state.sequence, Uuid::new_v4().simple());

        state.containers.insert(
            id.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: "created".to_string(),
                created_at: Utc::now(),
                labels: spec.labels.clone(),
                ports: vec![PortInfo {
                    host_ip: Some(spec.host.ip.clone()),
                    host_port: Some(host_port),
                    container_port: spec.container.port,
                    proto: spec.container.proto,
                }],
            },
        );

        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(EngineOp::Start)?;

        let wanted: Vec<(Option<String>, Option<u16>)> = state
            .container_mut(id)?
            .ports
            .iter()
            .map(|p| (p.host_ip.clone(), p.host_port))
            .collect();

        let taken = state.containers.values().any(|c| {
            c.id != id
                && c.is_running()
                && c.ports
                    .iter()
                    .any(|p| wanted.contains(&(p.host_ip.clone(), p.host_port)))
        });
        if taken {
            return Err(AgentError::Engine(format!(
                "driver failed programming external connectivity on {}: port is already allocated",
                id
            )));
        }

        state.container_mut(id)?.state = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(EngineOp::Stop)?;

        let container = state.container_mut(id)?;
        if container.is_running() {
            container.state = "exited".to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record(EngineOp::Remove)?;

        if state.container_mut(id)?.is_running() && !force {
            return Err(AgentError::Engine(format!(
                "You cannot remove a running container {}. Stop the container before attempting removal or force remove",
                id
            )));
        }

        state.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let mut state = self.state.lock().await;
        state.record(EngineOp::Inspect)?;
        Ok(state.container_mut(id)?.clone())
    }

    async fn list_containers(&self, labels: &HashMap<String, String>) -> Result<Vec<ContainerInfo>> {
        let mut state = self.state.lock().await;
        state.record(EngineOp::List)?;

        Ok(state
            .containers
            .values()
            .filter(|c| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}
