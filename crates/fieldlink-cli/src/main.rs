//! Command-line interface for the FieldLink device gateway.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fieldlink_core::config::env_vars;
use fieldlink_gateway::{CommandReceipt, Gateway, GatewayConfig};
use serde_json::{json, Value};

/// FieldLink - MQTT gateway for field devices.
#[derive(Parser, Debug)]
#[command(name = "fieldlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Broker host (overrides config and environment).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port (overrides config and environment).
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and stream gateway events as JSON lines until Ctrl-C.
    Run,
    /// Send a command to a device.
    Send {
        /// Target device id.
        device: String,
        /// Command name, e.g. get-status.
        command: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Do not wait for the device to respond.
        #[arg(long)]
        no_wait: bool,
        /// Response timeout in milliseconds (defaults to the configured command timeout).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Listen for a while and print the devices seen.
    Devices {
        /// Seconds to listen before printing.
        #[arg(long, default_value_t = 10)]
        watch_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;
    let gateway = Gateway::mqtt(config).context("Invalid gateway configuration")?;

    match args.command {
        Command::Run => run(&gateway).await,
        Command::Send {
            device,
            command,
            payload,
            no_wait,
            timeout_ms,
        } => send(&gateway, &device, &command, &payload, !no_wait, timeout_ms).await,
        Command::Devices { watch_secs } => devices(&gateway, watch_secs).await,
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "fieldlink=debug" } else { "fieldlink=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

/// Config file, then `FIELDLINK_*` environment, then command-line flags.
fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => GatewayConfig::default(),
    };
    config.apply_env()?;

    if let Some(host) = &args.host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    Ok(config)
}

async fn start_connected(gateway: &Gateway) -> Result<()> {
    gateway.start().await?;
    if !gateway.connection().is_connected() {
        gateway.shutdown().await;
        bail!(
            "Could not connect to broker at {}",
            gateway.config().broker.full_broker_addr()
        );
    }
    Ok(())
}

async fn run(gateway: &Gateway) -> Result<()> {
    let mut events = gateway.subscribe_events();
    gateway.start().await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some((event, meta)) = event else { break };
                let line = json!({
                    "event": event.event_name(),
                    "source": meta.source,
                    "timestamp": meta.timestamp,
                    "data": event,
                });
                println!("{}", line);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    gateway.shutdown().await;
    Ok(())
}

async fn send(
    gateway: &Gateway,
    device: &str,
    command: &str,
    payload: &str,
    wait: bool,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("--payload is not valid JSON")?;
    let timeout = gateway.config().commands.timeout(timeout_ms);
    start_connected(gateway).await?;

    let result = gateway
        .publish_command(device, command, payload, wait, timeout)
        .await;
    gateway.shutdown().await;

    match result? {
        CommandReceipt::Sent { correlation_id } => {
            println!("{}", json!({ "correlation_id": correlation_id, "sent": true }));
        }
        CommandReceipt::Response(response) => {
            println!(
                "{}",
                json!({
                    "correlation_id": response.correlation_id,
                    "device_id": response.device_id,
                    "topic": response.topic,
                    "data": response.data,
                })
            );
        }
    }
    Ok(())
}

async fn devices(gateway: &Gateway, watch_secs: u64) -> Result<()> {
    start_connected(gateway).await?;
    tokio::time::sleep(Duration::from_secs(watch_secs)).await;

    let devices = gateway.presence().list_devices();
    gateway.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}
