// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hivectl`: thin operator CLI for the hive compute daemon's external
//! interfaces (§6) — it holds no state and implements no lifecycle logic
//! of its own, only request/reply plumbing against a running node.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};
use output::OutputFormat;

const DEFAULT_BUS_ADDR: &str = "nats://127.0.0.1:4222";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8761";

#[derive(Parser)]
#[command(name = "hivectl", version, about = "Operator CLI for the hive compute daemon")]
struct Cli {
    /// Message bus address (NATS URL), used by bus-addressed commands.
    #[arg(long, global = true, default_value = DEFAULT_BUS_ADDR, env = "HIVE_BUS_ADDR")]
    bus: String,

    /// HTTP cluster-manager surface address (`host:port`).
    #[arg(long, global = true, default_value = DEFAULT_HTTP_ADDR, env = "HIVE_HTTP_ADDR")]
    http: String,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// GET /health on a node's cluster-manager surface.
    Health,
    /// GET /config on a node's cluster-manager surface.
    Config,
    /// POST /join to bootstrap a node into the cluster.
    Join {
        /// Name of the node being joined.
        node: String,
        #[arg(long)]
        region: String,
        #[arg(long)]
        az: String,
        #[arg(long = "data-dir")]
        data_dir: String,
        #[arg(long = "daemon-host")]
        daemon_host: String,
    },
    /// `ec2.DescribeInstances` over the bus.
    DescribeInstances,
    /// Drive one phase of the cluster-wide shutdown protocol.
    Shutdown {
        #[arg(value_enum)]
        phase: commands::shutdown::Phase,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Health => commands::health::run(&cli.http, cli.output).await,
        Command::Config => commands::config::run(&cli.http, cli.output).await,
        Command::Join { node, region, az, data_dir, daemon_host } => {
            commands::join::run(&cli.http, node, region, az, data_dir, daemon_host, cli.output).await
        }
        Command::DescribeInstances => commands::describe_instances::run(&cli.bus, cli.output).await,
        Command::Shutdown { phase } => commands::shutdown::run(&cli.bus, phase, cli.output).await,
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hivectl: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
