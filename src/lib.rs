//! deploy-agent - keeps named container deployments running on a Docker engine
//!
//! A deployment is a declarative spec (image, port bindings, command,
//! replica count) realized as a set of containers. The realized state is
//! persisted after every change so it survives restarts:
//!
//! - Deployment entity and per-replica spec building
//! - Snapshot persistence over a key-value store
//! - Container engine driver (Docker Engine API, or in-process)
//! - Orchestration of create, rolling image update, and stop

pub mod config;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod service;
pub mod store;

pub use config::AgentConfig;
pub use error::{AgentError, ErrorKind, Result};
pub use service::DeploymentService;
