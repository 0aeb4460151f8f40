//! PortGate CLI - local port exposure and forwarding tool
//!
//! Inspect which processes are listening on which local ports, forward local
//! ports to remote addresses, and terminate port-hogging processes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portgate_lib::PortGate;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PortGate - see and reshape your machine's network exposure
#[derive(Parser, Debug)]
#[command(name = "portgate")]
#[command(about = "PortGate - local port inspection and TCP forwarding")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List listening sockets and their owning processes
    #[command(long_about = r#"
Print a fresh snapshot of all listening TCP sockets and bound UDP sockets,
with the owning process where it can be resolved. Entries whose owner cannot
be determined (insufficient privilege, or the process exited mid-scan) are
still listed, with empty pid/process fields.

EXAMPLES:
  portgate ports
  portgate ports --json
    "#)]
    Ports {
        /// Emit the snapshot as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Forward a local port to a remote address until interrupted
    #[command(long_about = r#"
Bind a local listening port and relay every inbound TCP connection to the
remote address, byte for byte in both directions. Runs until Ctrl+C, then
shuts the rule down gracefully.

EXAMPLES:
  # Expose a remote PostgreSQL on local port 5433
  portgate forward --local-port 5433 --remote-address 192.168.1.100:5432

  # Let the OS pick the local port
  portgate forward --local-port 0 --remote-address 127.0.0.1:3000

ENVIRONMENT VARIABLES:
  PORTGATE_LOCAL_PORT      Local port to bind (0 = ephemeral)
  PORTGATE_REMOTE_ADDRESS  Target host:port to forward to
    "#)]
    Forward {
        /// Local port to bind (0 picks an ephemeral port)
        #[arg(long, env = "PORTGATE_LOCAL_PORT")]
        local_port: u16,

        /// Remote address to forward connections to (e.g., 127.0.0.1:5432)
        #[arg(long, env = "PORTGATE_REMOTE_ADDRESS")]
        remote_address: String,

        /// Grace period in seconds for closing in-flight connections on stop
        #[arg(long, default_value = "3")]
        stop_grace: u64,
    },

    /// Terminate the process with the given pid
    Kill {
        /// Process id to terminate
        #[arg(long)]
        pid: i32,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_ports(json: bool) -> Result<()> {
    let gate = PortGate::new();
    let mut snapshot = gate.list_ports().await;
    snapshot.sort_by_key(|p| (p.port, p.protocol.as_str()));

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("Failed to encode snapshot")?
        );
        return Ok(());
    }

    println!("{:<8} {:<6} {:<8} PROCESS", "PORT", "PROTO", "PID");
    for entry in &snapshot {
        println!(
            "{:<8} {:<6} {:<8} {}",
            entry.port,
            entry.protocol,
            entry
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry.process_name.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run_forward(local_port: u16, remote_address: &str, stop_grace: u64) -> Result<()> {
    let gate = PortGate::with_stop_grace(Duration::from_secs(stop_grace));

    let rule = gate
        .start_forward(local_port, remote_address)
        .await
        .context("Failed to start forwarding rule")?;

    info!(
        rule_id = %rule.id,
        local_port = rule.local_port,
        remote_address = %rule.remote_address,
        "Forwarding; press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    gate.shutdown().await;
    Ok(())
}

async fn run_kill(pid: i32) -> Result<()> {
    let gate = PortGate::new();
    gate.terminate_process(pid)
        .await
        .with_context(|| format!("Failed to terminate process {}", pid))?;
    info!(pid, "Termination signal delivered");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Ports { json } => run_ports(json).await,
        Commands::Forward {
            local_port,
            remote_address,
            stop_grace,
        } => run_forward(local_port, &remote_address, stop_grace).await,
        Commands::Kill { pid } => run_kill(pid).await,
    }
}
