//! wardend: the Warden daemon.
//!
//! Keeps a connection pool bound to whichever candidate is currently the
//! healthy primary, promoting a replica when the primary is lost. Clients
//! connect to the `[listen]` address and are relayed over that pool.
//!
//! # Usage
//!
//! ```text
//! wardend run   --config /etc/warden/warden.toml
//! wardend check --config /etc/warden/warden.toml
//! wardend probe --config /etc/warden/warden.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wardend", about = "Warden connection failover daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve clients and run the reconciliation loop until interrupted.
    Run {
        /// Path to warden.toml.
        #[arg(long, default_value = "warden.toml")]
        config: PathBuf,
    },
    /// Validate a config file and print it with defaults filled in.
    Check {
        #[arg(long, default_value = "warden.toml")]
        config: PathBuf,
    },
    /// Probe every candidate once and print the resolver's decision.
    Probe {
        #[arg(long, default_value = "warden.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Run { config } => daemon::run(&config).await,
        Command::Check { config } => daemon::check(&config),
        Command::Probe { config } => daemon::probe(&config).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,wardend=debug,warden=debug"));

    // Logs go to stderr; stdout is reserved for command output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
