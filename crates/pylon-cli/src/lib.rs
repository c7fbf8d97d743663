//! Command-line interface for Pylon
//!
//! Two subcommands: `pylon gateway` runs the central gateway (bootstrap
//! endpoints plus the agent-facing collaborator routes) and `pylon agent`
//! runs a downstream agent. Both exit non-zero on configuration errors or a
//! fatal bootstrap failure.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use pylon_agent::AgentError;
use pylon_common::config::ConfigError;
use pylon_common::telemetry::{init_telemetry, TelemetryConfig};

pub mod commands;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("storage error: {0}")]
    Storage(#[from] pylon_storage::StorageError),

    #[error("server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Parser)]
#[command(name = "pylon", about = "Multi-cluster observability federation", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the central gateway
    Gateway(GatewayArgs),
    /// Run a downstream agent
    Agent(AgentArgs),
}

#[derive(clap::Args)]
pub struct GatewayArgs {
    /// Path to the gateway config file
    #[arg(long, default_value = "/etc/pylon/gateway.yaml")]
    pub config: PathBuf,
}

#[derive(clap::Args)]
pub struct AgentArgs {
    /// Path to the agent config file
    #[arg(long, default_value = "/etc/pylon/agent.yaml")]
    pub config: PathBuf,

    /// Bootstrap token in `<id>.<secret>` hex form; required on first run
    #[arg(long)]
    pub token: Option<String>,

    /// Gateway public-key pin (base64 SPKI SHA-256); repeatable
    #[arg(long = "pin")]
    pub pins: Vec<String>,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let service_name = match &self.command {
            Commands::Gateway(_) => "pylon-gateway",
            Commands::Agent(_) => "pylon-agent",
        };
        init_telemetry(TelemetryConfig {
            service_name: service_name.to_string(),
        })
        .map_err(|e| CliError::Config(e.to_string()))?;

        match self.command {
            Commands::Gateway(args) => commands::gateway::run(args).await,
            Commands::Agent(args) => commands::agent::run(args).await,
        }
    }
}
