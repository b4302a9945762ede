// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, GatewayCommands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Gateway { command } => run_gateway_command(command).await,
    }
}

async fn run_gateway_command(cmd: GatewayCommands) -> anyhow::Result<()> {
    match cmd {
        GatewayCommands::Start { config, base_dir } => {
            let mut gw_config = dorabot_config::load(config.as_deref())?;
            if base_dir.is_some() {
                gw_config.base_dir = base_dir;
            }
            // The gateway supervises agent runs through the producer
            // contract; the bundled echo driver stands in until a real
            // agent driver is configured.
            let producer = Arc::new(dorabot_agent::EchoProducer);
            dorabot_gateway::node::run(gw_config, producer).await
        }

        GatewayCommands::RegenerateToken { config } => {
            let gw_config = dorabot_config::load(config.as_deref())?;
            dorabot_gateway::node::regenerate_token(&gw_config)
        }

        GatewayCommands::ShowConfig { config } => {
            let gw_config = dorabot_config::load(config.as_deref())?;
            println!("{}", serde_yaml::to_string(&gw_config)?);
            Ok(())
        }
    }
}

fn init_logging(verbosity: u8) {
    // DORABOT_LOG_FILE appends to a file (useful under a supervisor);
    // otherwise logs go to stderr. RUST_LOG always wins over -v.
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Ok(log_path) = std::env::var("DORABOT_LOG_FILE") {
        use std::sync::Mutex;
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let _ = tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .with(filter)
                .try_init();
            return;
        }
    }

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
