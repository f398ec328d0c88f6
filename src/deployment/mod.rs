//! Deployment entity, per-replica spec building and persistence

pub mod config;
pub mod model;
pub mod repository;
pub mod spec;

pub use config::{ContainerNet, DeploymentConfig, HostNet, Protocol};
pub use model::{ContainerBinding, ContainerDescriptor, Deployment, DeploymentPhase, HostBinding};
pub use repository::{DeploymentRepository, DEPLOYMENTS_COLLECTION};
pub use spec::ContainerSpec;
