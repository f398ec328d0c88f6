//! Error types for the deployment agent

use thiserror::Error;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Deployment already exists: {0}")]
    Conflict(String),

    #[error("Invalid deployment: {0}")]
    Validation(String),

    #[error("Engine error: {0}")]
    Engine(String),

    /// The engine has no container with this ID
    #[error("Engine error: No such container: {0}")]
    NoSuchContainer(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Closed set of error kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    Engine,
    Persistence,
    Config,
}

impl AgentError {
    /// Kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::Conflict(_) => ErrorKind::Conflict,
            AgentError::Validation(_) => ErrorKind::Validation,
            AgentError::Engine(_) | AgentError::NoSuchContainer(_) => ErrorKind::Engine,
            AgentError::Persistence(_) => ErrorKind::Persistence,
            AgentError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the engine reported the container as already gone
    pub fn is_missing_container(&self) -> bool {
        matches!(self, AgentError::NoSuchContainer(_))
    }
}

impl ErrorKind {
    /// Status code an HTTP front end reports for this kind
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::Engine | ErrorKind::Persistence | ErrorKind::Config => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Engine => write!(f, "engine"),
            ErrorKind::Persistence => write!(f, "persistence"),
            ErrorKind::Config => write!(f, "config"),
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Persistence(e.to_string())
    }
}
