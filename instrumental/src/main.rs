//! instrumental - CLI for reporting metrics to an Instrumental collector
//!
//! This tool provides commands for:
//! - Checking collector configuration
//! - Sending one-shot metrics from scripts and cron jobs
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/instrumental/config.toml (~/.config/instrumental/config.toml)
//! - Logs: $XDG_STATE_HOME/instrumental/instrumental.log (~/.local/state/instrumental/instrumental.log)

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use instrumental_core::{Collector, Config};

#[derive(Parser)]
#[command(name = "instrumental")]
#[command(about = "Report metrics to an Instrumental collector")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show collector configuration and status
    Status,

    /// Send a single metric
    #[command(subcommand)]
    Send(SendCommand),
}

#[derive(Subcommand)]
enum SendCommand {
    /// Increment a counter metric
    Increment {
        /// Metric name
        name: String,

        /// Amount to increment by
        #[arg(short, long, default_value = "1")]
        amount: i64,
    },

    /// Report a gauge reading
    Gauge {
        /// Metric name
        name: String,

        /// Gauge value
        value: f64,

        /// Report as an absolute gauge
        #[arg(long)]
        absolute: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging if verbose
    let _log_guard = if args.verbose {
        Some(
            instrumental_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Send(command) => cmd_send(&config, command).await,
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Instrumental Collector Configuration");
    println!("====================================");
    println!();

    let collector = &config.collector;

    println!(
        "API Key:   {}",
        if collector.is_ready() { "<set>" } else { "<not set>" }
    );
    println!(
        "Prefix:    {}",
        collector.prefix.as_deref().unwrap_or("<none>")
    );
    println!("Endpoint:  {}:{}", collector.host, collector.port);
    println!("Timeout:   {}s", collector.response_timeout_secs);

    println!();
    if collector.is_ready() {
        println!("Status: Ready to report");
    } else {
        println!("Status: Not ready (missing API key)");
        println!();
        println!("Set the API key in {}:", Config::config_path().display());
        println!();
        println!("  [collector]");
        println!("  api_key = \"ik_live_xxxxxxxxxxxx\"");
    }

    Ok(())
}

async fn cmd_send(config: &Config, command: SendCommand) -> Result<()> {
    if !config.collector.is_ready() {
        println!("Collector is not configured. Run 'status' for details.");
        return Ok(());
    }

    let collector = Collector::new(config.collector.clone())
        .context("failed to create collector session")?;

    // Give the handshake a bounded window; the metric queues in the meantime
    // if it has not finished.
    let authenticated = wait_for(|| collector.is_authenticated(), Duration::from_secs(10)).await;
    if authenticated {
        tracing::info!(host = %config.collector.host, "authenticated with collector");
    } else {
        tracing::warn!(host = %config.collector.host, "handshake incomplete, sending anyway");
        println!(
            "Warning: not authenticated with {} yet; metric delivery is best effort",
            config.collector.host
        );
    }

    match command {
        SendCommand::Increment { name, amount } => {
            collector.increment_by(&name, amount);
            println!("increment {} {}", name, amount);
        }
        SendCommand::Gauge {
            name,
            value,
            absolute,
        } => {
            if absolute {
                collector.gauge_absolute(&name, value);
            } else {
                collector.gauge(&name, value);
            }
            println!("gauge {} {}", name, value);
        }
    }

    // Let the line reach the transport, then close behind it
    wait_for(|| collector.pending_count() == 0, Duration::from_secs(5)).await;
    collector.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(())
}

/// Poll a condition until it holds or the timeout passes
async fn wait_for<F: FnMut() -> bool>(mut condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
