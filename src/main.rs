//! deploy-agent command line

use anyhow::Context;
use clap::{Parser, Subcommand};
use deploy_agent::config::EngineKind;
use deploy_agent::deployment::DeploymentConfig;
use deploy_agent::AgentConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// deploy-agent - run named container deployments on a Docker engine
#[derive(Parser)]
#[command(name = "deploy-agent")]
#[command(version)]
#[command(about = "Create, update and stop replicated container deployments", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Agent configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the deployment store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine endpoint, e.g. unix:///var/run/docker.sock or tcp://127.0.0.1:2375
    #[arg(long, global = true)]
    docker_host: Option<String>,

    /// Engine implementation (docker or memory)
    #[arg(long, global = true)]
    engine: Option<EngineKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a deployment from a JSON or YAML file
    Create {
        /// Deployment file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show a deployment
    Get {
        /// Deployment name
        name: String,
    },

    /// Stop a deployment and remove its containers
    Stop {
        /// Deployment name
        name: String,
    },

    /// Replace every replica with a new image
    Update {
        /// Deployment name
        name: String,
        /// New image reference
        image: String,
    },

    /// List deployments
    #[command(name = "ls")]
    List,

    /// Compare a deployment with the containers on the engine
    Status {
        /// Deployment name
        name: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    config.apply_env();

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(host) = &cli.docker_host {
        config.docker_host = host.clone();
    }
    if let Some(engine) = cli.engine {
        config.engine = engine;
    }

    Ok(config)
}

fn read_deployment_file(path: &Path) -> anyhow::Result<DeploymentConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let config = if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid deployment file {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("invalid deployment file {}", path.display()))?
    };

    Ok(config)
}

/// Result of a completed stop
#[derive(Serialize)]
struct Stopped<'a> {
    name: &'a str,
    stopped: bool,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let service = config
        .build_service()
        .context("failed to initialize deployment service")?;

    match cli.command {
        Commands::Create { file } => {
            let deployment_config = read_deployment_file(&file)?;
            let deployment = service.create(deployment_config).await?;
            print_json(&deployment)?;
        }

        Commands::Get { name } => {
            let deployment = service.get(&name).await?;
            print_json(&deployment)?;
        }

        Commands::Stop { name } => {
            service.stop(&name).await?;
            print_json(&Stopped {
                name: &name,
                stopped: true,
            })?;
        }

        Commands::Update { name, image } => {
            let deployment = service.update(&name, &image).await?;
            print_json(&deployment)?;
        }

        Commands::List => {
            let deployments = service.list().await?;
            print_json(&deployments)?;
        }

        Commands::Status { name } => {
            let status = service.status(&name).await?;
            print_json(&status)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_agent::deployment::{Deployment, Protocol};

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::parse_from([
            "deploy-agent",
            "ls",
            "--docker-host",
            "unix:///run/user/1000/docker.sock",
            "--engine",
            "memory",
        ]);
        assert!(matches!(cli.command, Commands::List));
        assert_eq!(cli.docker_host.as_deref(), Some("unix:///run/user/1000/docker.sock"));
        assert_eq!(cli.engine, Some(EngineKind::Memory));
    }

    #[test]
    fn test_listing_and_stop_render_as_json() {
        let config = DeploymentConfig::new("web", "nginx:1.25")
            .replicas(1)
            .container_port(80, Protocol::Tcp)
            .host_ports("0.0.0.0", 8080, Protocol::Tcp);
        let listing = serde_json::to_value(vec![Deployment::new(config)]).unwrap();
        assert_eq!(listing[0]["name"], "web");

        let stopped = serde_json::to_value(Stopped {
            name: "web",
            stopped: true,
        })
        .unwrap();
        assert_eq!(stopped, serde_json::json!({"name": "web", "stopped": true}));
    }
}
