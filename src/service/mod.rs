//! Deployment orchestration service

pub mod locks;
pub mod orchestrator;
pub mod status;

pub use locks::NameLocks;
pub use orchestrator::{DeploymentService, DEFAULT_STOP_TIMEOUT};
pub use status::{DeploymentStatus, ReplicaStatus};
