//! wslink CLI Entry Point
//!
//! This is the main entry point for the wslink binary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wslink::cli::config::{Config, LoggingConfig};
use wslink::connection::codec::{self, DecodeMode};
use wslink::connection::manager::ConnectionManager;
use wslink::connection::protocol::Payload;
use wslink::connection::state::ConnectionState;
use wslink::connection::stream::StatusStream;
use wslink::connection::transport::TungsteniteTransport;

#[derive(Parser)]
#[command(name = "wslink")]
#[command(author, version, about = "wslink - WebSocket batch session client")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/wslink.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// WebSocket URL, overrides the configuration file
    #[arg(long, env = "WSLINK_URL", global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, announce the batch and print every message until closed
    Watch {
        /// Batch identifier to announce once the connection opens
        #[arg(long, env = "WSLINK_ID_BATCH")]
        id_batch: Option<String>,

        /// Do not announce the batch
        #[arg(long)]
        no_announce: bool,
    },
    /// Connect, send one payload and close
    Send {
        /// Payload to send
        payload: String,

        /// Parse the payload as JSON before sending
        #[arg(long)]
        json: bool,
    },
    /// Decode a message offline, the way inbound frames are decoded
    Decode {
        /// Raw message text
        text: String,

        /// Only accept plain JSON
        #[arg(long)]
        strict: bool,
    },
    /// Write the default configuration file
    InitConfig {
        /// Destination path
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(url) = cli.url {
        config.connection.url = url;
    }

    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Watch {
            id_batch,
            no_announce,
        } => {
            if let Some(id_batch) = id_batch {
                config.session.id_batch = id_batch;
            }
            watch(&config, !no_announce).await?;
        }
        Commands::Send { payload, json } => {
            let payload = if json {
                let value: serde_json::Value =
                    serde_json::from_str(&payload).context("Payload is not valid JSON")?;
                Payload::Structured(value)
            } else {
                Payload::Text(payload)
            };
            send_once(&config, payload).await?;
        }
        Commands::Decode { text, strict } => {
            let mode = if strict {
                DecodeMode::Strict
            } else {
                config.connection.decode_mode
            };
            show_decoded(&text, mode)?;
        }
        Commands::InitConfig { path, force } => {
            init_config(&path, force)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.level))
            .with_context(|| format!("Invalid log level: {}", logging.level))?
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().with_thread_ids(true).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))
}

fn build_manager(config: &Config) -> ConnectionManager {
    ConnectionManager::builder(Arc::new(TungsteniteTransport))
        .options(config.connection.manager_options())
        .build()
}

/// Wait until the connection opens (`true`) or falls back to closed (`false`)
async fn wait_for_open(status: &mut StatusStream) -> bool {
    while let Some(state) = status.next().await {
        match state {
            ConnectionState::Open => return true,
            ConnectionState::Closed => return false,
            ConnectionState::Connecting => {}
        }
    }
    false
}

async fn watch(config: &Config, announce: bool) -> Result<()> {
    let manager = build_manager(config);
    let mut raw = manager.raw_messages();
    let mut decoded = manager.decoded_messages();

    info!(url = %config.connection.url, "Connecting");
    manager.connect(&config.connection.url);
    let mut status = manager.status();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut opened = false;
    loop {
        tokio::select! {
            biased;

            _ = &mut ctrl_c => {
                info!("Interrupted, closing connection");
                break;
            }

            state = status.next() => {
                let Some(state) = state else { break };
                println!("[status] {}", state);
                match state {
                    ConnectionState::Open => {
                        opened = true;
                        if announce {
                            manager.send(config.session.announcement());
                        }
                    }
                    ConnectionState::Closed => break,
                    ConnectionState::Connecting => {}
                }
            }

            Some(message) = raw.next() => {
                println!("[raw] {}", message);
            }

            Some(value) = decoded.next() => {
                let pretty = serde_json::to_string_pretty(&value)
                    .context("Failed to render decoded message")?;
                println!("[json] {}", pretty);
            }
        }
    }

    manager.shutdown().await;

    if !opened {
        bail!("Connection to {} closed before opening", config.connection.url);
    }
    Ok(())
}

async fn send_once(config: &Config, payload: Payload) -> Result<()> {
    let manager = build_manager(config);
    manager.connect(&config.connection.url);
    let mut status = manager.status();

    // The manager enforces the connect timeout itself; this only guards a stuck stream.
    let limit = manager.options().connect_timeout + Duration::from_secs(1);
    let opened = timeout(limit, wait_for_open(&mut status)).await.unwrap_or(false);
    if !opened {
        manager.shutdown().await;
        bail!("Could not connect to {}", config.connection.url);
    }

    info!(payload = %payload, "Sending payload");
    manager.send(payload);
    manager.close();
    manager.shutdown().await;

    if manager.dropped_sends() > 0 {
        warn!("Payload was dropped");
    }
    Ok(())
}

fn show_decoded(text: &str, mode: DecodeMode) -> Result<()> {
    match codec::decode(text, mode) {
        Some(value) => {
            let pretty = serde_json::to_string_pretty(&value)
                .context("Failed to render decoded message")?;
            println!("{}", pretty);
        }
        None => println!("not decodable"),
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Config::default_config().save(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

fn show_version() {
    println!("wslink {}", env!("CARGO_PKG_VERSION"));
    println!("Single-connection WebSocket client for batch sessions");
    println!();
    println!("Features:");
    println!("  - Observable connection state (CLOSED, CONNECTING, OPEN)");
    println!("  - Raw and decoded message streams");
    println!("  - Lenient JSON decoding of inbound frames");
}
