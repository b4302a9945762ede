// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Local-first single-user agent gateway.
#[derive(Parser, Debug)]
#[command(name = "dorabot", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Gateway lifecycle commands.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommands,
    },
}

/// `dorabot gateway` subcommands.
#[derive(Subcommand, Debug)]
pub enum GatewayCommands {
    /// Start the gateway (wss listener, event log, agent supervision).
    ///
    /// Binds loopback only. On first start a bearer token is written to
    /// `<base>/gateway-token` and a self-signed certificate to
    /// `<base>/tls/`; clients read the token file and pin the cert.
    Start {
        /// Path to an explicit gateway config file (YAML).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Override the base directory (default: ~/.dorabot).
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },

    /// Regenerate the bearer token.
    ///
    /// The new token is printed once and written to the token file. The
    /// old token is immediately invalidated.
    RegenerateToken {
        /// Path to an explicit gateway config file (YAML).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Print the effective gateway configuration and exit.
    ShowConfig {
        /// Path to an explicit gateway config file (YAML).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}
