//! Operator is a long lived process that gang-schedules LoadTest worker pods.
#![deny(missing_docs)]
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{command, Args, Parser, Subcommand};
use gantry_common::telemetry;
use gantry_operator::{defaults::Defaults, leader, loadtest};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "OPERATOR_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon
    Daemon(DaemonOpts),
}

/// Options for the daemon.
#[derive(Args, Debug)]
pub struct DaemonOpts {
    /// Near-maximum duration of one reconcile invocation.
    #[arg(
        long,
        env = "OPERATOR_RECONCILIATION_TIMEOUT",
        default_value = "1m",
        value_parser = humantime::parse_duration
    )]
    reconciliation_timeout: Duration,

    /// Acquire a leader lease before reconciling, so that multiple
    /// replicas can run with a single active leader.
    #[arg(long, env = "OPERATOR_ENABLE_LEADER_ELECTION")]
    enable_leader_election: bool,

    /// YAML file carrying the defaults bundle applied to tests.
    #[arg(long, env = "OPERATOR_DEFAULTS_FILE")]
    defaults_file: Option<PathBuf>,

    /// Namespace holding the leader lease.
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "gantry-system")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init_tracing(args.otlp_endpoint.clone()).await?;

    match args.command {
        Command::Daemon(opts) => {
            let defaults: Defaults = match &opts.defaults_file {
                Some(path) => serde_yaml::from_str(&tokio::fs::read_to_string(path).await?)?,
                None => Defaults::default(),
            };

            if opts.enable_leader_election {
                let client = kube::Client::try_default().await?;
                let identity = std::env::var("POD_NAME")
                    .unwrap_or_else(|_| format!("gantry-operator-{}", std::process::id()));
                leader::acquire(client, &opts.namespace, identity).await?;
            }

            info!(
                reconciliation_timeout = ?opts.reconciliation_timeout,
                "starting LoadTest controller"
            );
            loadtest::run(defaults, opts.reconciliation_timeout).await;
        }
    }

    telemetry::shutdown();
    Ok(())
}
