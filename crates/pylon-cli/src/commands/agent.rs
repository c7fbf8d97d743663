//! `pylon agent`: run a downstream agent
//!
//! On first run the operator passes the bootstrap token and at least one
//! gateway pin; afterwards the persisted keyring carries the trust and the
//! flags can be dropped.

use std::sync::Arc;

use tracing::info;

use pylon_agent::{Agent, AgentOptions};
use pylon_bootstrap::{Bootstrapper, ClientConfig, PublicKeyPin};
use pylon_common::config::load_agent_config;
use pylon_keyring::RawToken;

use crate::{AgentArgs, CliError, Result};

pub async fn run(args: AgentArgs) -> Result<()> {
    let config = load_agent_config(&args.config)?;

    let bootstrapper: Option<Arc<dyn Bootstrapper>> = match &args.token {
        Some(token) => {
            if args.pins.is_empty() {
                return Err(CliError::Config(
                    "at least one --pin is required when bootstrapping with --token".into(),
                ));
            }
            let raw = RawToken::from_token_string(token)
                .map_err(|e| CliError::Config(format!("invalid --token: {e}")))?;
            let pins = args
                .pins
                .iter()
                .map(|p| PublicKeyPin::from_b64(p))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| CliError::Config(format!("invalid --pin: {e}")))?;
            Some(Arc::new(ClientConfig::new(
                raw,
                pins,
                config.spec.gateway_address.clone(),
            )))
        }
        None => None,
    };

    let agent = Arc::new(
        Agent::new(
            config,
            AgentOptions {
                bootstrapper,
                ..Default::default()
            },
        )
        .await?,
    );

    let shutdown_agent = agent.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down agent");
            shutdown_agent.shutdown().await;
        }
    });

    agent.listen_and_serve().await?;
    Ok(())
}
