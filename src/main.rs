//! rtload - Real-time Session Load Driver
//!
//! Opens many concurrent sessions against an event-based real-time endpoint
//! (HTTP short-poll handshake upgraded to WebSocket), runs a scripted
//! workload on each and reports connect and acknowledgement latencies.

mod auth;
mod config;
mod harness;
mod metrics;
mod network;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use auth::TokenSource;
use config::Config;
use harness::{LoadDriver, RunReport};
use metrics::Aggregator;
use network::{Session, SessionEvent, WsConnector};

/// rtload - Load driver for real-time event endpoints
#[derive(Parser)]
#[command(name = "rtload")]
#[command(author = "rtload Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Drive concurrent real-time sessions and measure latencies", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured load scenario
    Run {
        /// Override the number of virtual clients
        #[arg(short = 'n', long)]
        clients: Option<usize>,

        /// Override the target handshake URL
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Open a single session and optionally emit one event
    Probe {
        /// Event to emit once connected
        #[arg(short, long)]
        event: Option<String>,

        /// Event arguments as a JSON array
        #[arg(short, long, default_value = "[]")]
        args: String,

        /// Wait for the peer's acknowledgement
        #[arg(long)]
        ack: bool,

        /// Override the target handshake URL
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Write the generated (or current) config here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Run { clients, url } => {
            if let Some(clients) = clients {
                config.load.clients = clients;
            }
            if let Some(url) = url {
                config.target.url = url;
            }
            run_load(config).await?;
        }
        Commands::Probe {
            event,
            args,
            ack,
            url,
        } => {
            if let Some(url) = url {
                config.target.url = url;
            }
            run_probe(config, event, &args, ack).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else if let Some(path) = output {
                config.save(&path)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run the configured load scenario and report
async fn run_load(config: Config) -> anyhow::Result<()> {
    let session_config = config.session_config()?;
    let tokens = TokenSource::from_config(&config.auth)?;
    let aggregator = Arc::new(Aggregator::new());

    let driver = LoadDriver::new(
        session_config,
        config.load.clone(),
        tokens,
        Arc::new(WsConnector::new()),
        aggregator.clone(),
    );

    let summary = tokio::select! {
        summary = driver.run() => summary,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, reporting partial results.");
            harness::RunSummary {
                clients: config.load.clients,
                ..Default::default()
            }
        }
    };

    let report = RunReport::new(config.target.url.clone(), summary, aggregator.snapshot());
    println!();
    report.print_summary();

    if let Some(path) = &config.report.output {
        report.write_json(path)?;
        println!("\nReport written to: {}", path.display());
    }

    Ok(())
}

/// Connect one session, emit at most one event and disconnect
async fn run_probe(
    config: Config,
    event: Option<String>,
    args: &str,
    ack: bool,
) -> anyhow::Result<()> {
    let args: Vec<serde_json::Value> = serde_json::from_str(args)?;
    let session_config = config.session_config()?;
    let token = TokenSource::from_config(&config.auth)?.token_for(0).await?;

    let session = Session::new(session_config, Arc::new(WsConnector::new()));
    let mut events = session.take_event_receiver();

    let started = tokio::time::Instant::now();
    session.connect(&token).await?;
    println!(
        "Connected to {} in {} ms (sid {})",
        config.target.url,
        started.elapsed().as_millis(),
        session.sid().await.unwrap_or_default()
    );

    if let Some(event) = event {
        if ack {
            let started = tokio::time::Instant::now();
            let reply = session.emit_with_ack(&event, args).await?;
            println!(
                "Ack for '{}' after {} ms: {}",
                event,
                started.elapsed().as_millis(),
                serde_json::Value::Array(reply)
            );
        } else {
            session.emit(&event, args).await?;
            println!("Emitted '{}'", event);
        }
    }

    session.close().await?;

    if let Some(events) = events.as_mut() {
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Disconnected { reason } = event {
                tracing::info!("Session ended: {}", reason);
            }
        }
    }

    let stats = session.stats();
    println!(
        "Frames sent: {}, received: {}, dropped: {}",
        stats.frames_sent(),
        stats.frames_received(),
        stats.frames_dropped()
    );

    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("rtload Protocol Information");
    println!("===========================\n");

    println!("Protocol revision: {}", protocol::PROTOCOL_VERSION);
    println!("Version query key: {}", protocol::DEFAULT_VERSION_PARAM);
    println!("Transports: polling handshake, websocket upgrade");
    println!("Upgrade probe: \"2{}\" / \"3{}\"", protocol::PROBE, protocol::PROBE);

    println!("\nFrame types:");
    for kind in protocol::FrameType::ALL {
        println!("  {}  {:?}", kind.as_char(), kind);
    }

    println!("\nPacket types:");
    for kind in protocol::PacketType::ALL {
        println!("  {}  {:?}", kind.as_char(), kind);
    }
}
