//! Pylon CLI
//!
//! Entry point for the gateway and agent processes.

use clap::Parser;

use pylon_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run().await
}
