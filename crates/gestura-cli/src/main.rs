//! `gestura` – robot gesture state relay.
//!
//! This binary wires the relay together and exposes a few operator tools:
//!
//! 1. `serve` (default) loads `~/.gestura/config.toml`, starts the optional
//!    MQTT broker adapter and boots the cockpit HTTP/WebSocket server.
//! 2. `init` writes a default configuration file.
//! 3. `monitor` prints every snapshot published on the broker topic.
//! 4. `simulate` posts a scripted gesture session to a running relay.
//!
//! **Ctrl-C** shuts the server down gracefully.

mod config;
mod monitor;
mod simulate;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc;
use tracing::{error, info};

use gestura_cockpit::CockpitServer;
use gestura_middleware::{BrokerClient, ConnectionRegistry, MqttConnector, StateRelay, StateStore};

/// Queue between the broker event loop and the upstream ingress task.
const BROKER_INGRESS_CAPACITY: usize = 64;

#[derive(Debug, Parser)]
#[command(name = "gestura", version, about = "Real-time robot gesture state relay")]
struct Cli {
    /// Configuration file (default: ~/.gestura/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Override the listening port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write a default configuration file if none exists.
    Init,
    /// Print snapshots published on the broker topic.
    Monitor,
    /// Post a scripted gesture session to a running relay.
    Simulate {
        #[arg(long, default_value = "http://localhost:5000")]
        url: String,
        /// Pause between steps.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Number of steps to send; 0 loops until Ctrl-C.
        #[arg(long, default_value_t = 0)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Installed before the runtime exists; see telemetry::build_provider.
    let _telemetry = telemetry::init_tracing("gestura");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gestura exited with an error");
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), String> {
    let path = cli.config.unwrap_or_else(config::config_path);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            print_banner();
            let mut cfg = config::load_or_default(&path)?;
            if let Some(port) = port {
                cfg.server.port = port;
            }
            serve(cfg).await
        }
        Command::Init => init(&path),
        Command::Monitor => {
            let cfg = config::load_or_default(&path)?;
            tokio::select! {
                res = monitor::run(&cfg.broker) => res,
                _ = tokio::signal::ctrl_c() => {
                    println!("\n  Stopping monitor.");
                    Ok(())
                }
            }
        }
        Command::Simulate { url, interval_ms, count } => {
            tokio::select! {
                res = simulate::run(&url, Duration::from_millis(interval_ms), count) => res,
                _ = tokio::signal::ctrl_c() => {
                    println!("\n  Stopping simulation.");
                    Ok(())
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serve
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(cfg: config::Config) -> Result<(), String> {
    info!(config = ?cfg, "starting relay");

    let store = Arc::new(StateStore::new(cfg.server.history_len));
    let registry = Arc::new(ConnectionRegistry::new(cfg.server.channel_buffer));
    let mut relay = StateRelay::new(store, registry);

    let mut ingress = None;
    if cfg.broker.enabled {
        let (inbound, upstream) = if cfg.broker.subscribe_topic.is_some() {
            let (tx, rx) = mpsc::channel(BROKER_INGRESS_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let connector = Arc::new(MqttConnector::new(cfg.broker.clone(), inbound));
        relay = relay.with_broker(Arc::new(BrokerClient::new(cfg.broker.clone(), connector)));
        ingress = upstream.map(|rx| relay.spawn_broker_ingress(rx));

        println!(
            "  Broker:    {}:{} → topic {}",
            cfg.broker.host.bold(),
            cfg.broker.port,
            cfg.broker.topic.bold()
        );
    } else {
        println!("  Broker:    {}", "disabled".dimmed());
    }

    let server = CockpitServer::new(relay)
        .with_host(cfg.server.host)
        .with_port(cfg.server.port);
    println!("  Listening: {}", format!("http://{}", server.addr()).bold());
    println!("  Push-channel: {}\n", format!("ws://{}/ws", server.addr()).bold());

    let result = server.run_until(shutdown_signal()).await;

    if let Some(task) = ingress {
        task.abort();
    }
    result.map_err(|e| e.to_string())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    println!();
    println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
}

// ─────────────────────────────────────────────────────────────────────────────
// init
// ─────────────────────────────────────────────────────────────────────────────

fn init(path: &std::path::Path) -> Result<(), String> {
    if path.exists() {
        println!("  Config already exists at {}", path.display().to_string().bold());
        return Ok(());
    }
    config::save_to(&config::Config::default(), path)?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}", "Gestura".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Robot gesture state relay");
    println!();
}
