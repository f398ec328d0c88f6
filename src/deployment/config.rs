//! Deployment configuration

use crate::error::{AgentError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::OnceLock;

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(AgentError::Validation(format!("unknown protocol: {}", other))),
        }
    }
}

/// Container side of the port binding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNet {
    /// Port inside the container
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub port: u16,
    /// Protocol
    #[serde(default)]
    pub proto: Protocol,
}

/// Host side template; replica `i` binds `port_first + i`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostNet {
    /// Host IP to bind on
    pub ip: String,
    /// Host port of the first replica
    pub port_first: u16,
    /// Protocol
    #[serde(default)]
    pub proto: Protocol,
}

impl Default for HostNet {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port_first: 0,
            proto: Protocol::Tcp,
        }
    }
}

/// Declarative deployment configuration, supplied once at creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Deployment name, unique key in the repository
    pub name: String,
    /// Image reference
    pub image: String,
    /// Container network template
    #[serde(default)]
    pub container_net: ContainerNet,
    /// Host network template
    #[serde(default)]
    pub host_net: HostNet,
    /// Replica count
    #[serde(default)]
    pub replicas: u32,
    /// Command arguments
    #[serde(default)]
    pub command: Vec<String>,
    /// Extra container labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("deployment name pattern is valid")
    })
}

impl DeploymentConfig {
    /// Create a new configuration
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    /// Set replica count
    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set container port and protocol
    pub fn container_port(mut self, port: u16, proto: Protocol) -> Self {
        self.container_net = ContainerNet { port, proto };
        self
    }

    /// Set host binding template
    pub fn host_ports(mut self, ip: &str, port_first: u16, proto: Protocol) -> Self {
        self.host_net = HostNet {
            ip: ip.to_string(),
            port_first,
            proto,
        };
        self
    }

    /// Set command to run
    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Host port for replica `index`
    pub fn host_port_for(&self, index: u32) -> Result<u16> {
        u32::from(self.host_net.port_first)
            .checked_add(index)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                AgentError::Validation(format!(
                    "host port for replica {} exceeds 65535",
                    index
                ))
            })
    }

    /// Check the configuration before anything is persisted
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AgentError::Validation("name must not be empty".to_string()));
        }

        if !name_pattern().is_match(&self.name) {
            return Err(AgentError::Validation(format!(
                "invalid deployment name: {}",
                self.name
            )));
        }

        if self.image.trim().is_empty() {
            return Err(AgentError::Validation("image must not be empty".to_string()));
        }

        if self.container_net.port == 0 {
            return Err(AgentError::Validation(
                "container port must be between 1 and 65535".to_string(),
            ));
        }

        self.host_net.ip.parse::<IpAddr>().map_err(|_| {
            AgentError::Validation(format!("invalid host ip: {}", self.host_net.ip))
        })?;

        if self.replicas > 0 {
            if self.host_net.port_first == 0 {
                return Err(AgentError::Validation(
                    "first host port must be between 1 and 65535".to_string(),
                ));
            }
            self.host_port_for(self.replicas - 1)?;
        }

        Ok(())
    }
}

fn port_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {}", text))),
    }
}
