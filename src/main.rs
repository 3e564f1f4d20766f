//! devlink command line: watch devices, send commands, inspect configuration

use clap::{Parser, Subcommand};
use devlink::config::DevlinkConfig;
use devlink::http::{HttpCollaborator, HttpMethod, ReqwestCollaborator};
use devlink::observability::init_default_logging;
use devlink::protocol::{DevicePayload, QoS, TopicBuilder};
use devlink::session::{InboundEvent, Session};
use devlink::transport::MqttTransport;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "devlink")]
#[command(about = "Command and monitor remote media devices over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DEVLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log device status, acknowledgments and content responses until interrupted
    Run {
        /// Only watch these devices (default: all)
        #[arg(short, long)]
        device: Vec<String>,
    },
    /// Invoke a named operation on one device and wait for the broker to accept it
    Send {
        device: String,
        operation: String,
        /// Raw argument bytes, sent as UTF-8
        #[arg(long, default_value = "")]
        args: String,
        /// Seconds to wait for the device's ack after delivery
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Request a path from the configured HTTP content service
    Fetch {
        path: String,
        #[arg(long, default_value = "GET")]
        method: String,
    },
    /// Validate the configuration
    Config {
        /// Show the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { device } => run(config, device).await,
        Commands::Send {
            device,
            operation,
            args,
            wait,
        } => send(config, &device, &operation, args, Duration::from_secs(wait)).await,
        Commands::Fetch { path, method } => fetch(config, &path, &method).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DevlinkConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DevlinkConfig::load_from_file(path)?);
    }

    for candidate in ["devlink.toml", "config/devlink.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DevlinkConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create devlink.toml".into())
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

async fn run(config: DevlinkConfig, devices: Vec<String>) -> CliResult {
    let session = Session::new(MqttTransport::new());
    let mut events = session.events();
    session.connect(config.session).await?;

    if devices.is_empty() {
        session
            .subscribe(TopicBuilder::all_status_filter(), QoS::AtLeastOnce)
            .await?;
        session.subscribe("device/+/ack", QoS::AtLeastOnce).await?;
    } else {
        for device in &devices {
            session
                .subscribe(&TopicBuilder::status_topic(device), QoS::AtLeastOnce)
                .await?;
            session
                .subscribe(&TopicBuilder::ack_topic(device), QoS::AtLeastOnce)
                .await?;
        }
    }
    session
        .subscribe(TopicBuilder::content_response_topic(), QoS::AtLeastOnce)
        .await?;
    info!(devices = devices.len(), "Watching devices");

    loop {
        tokio::select! {
            result = wait_for_shutdown_signal() => {
                result?;
                info!("Shutdown signal received");
                break;
            }
            event = events.next() => match event {
                Some(InboundEvent::Message(message)) => {
                    info!(topic = %message.topic, kind = message.payload.kind_name(), payload = ?message.payload, "Device message");
                }
                Some(InboundEvent::Malformed { topic, error }) => {
                    warn!(%topic, %error, "Malformed device message");
                }
                Some(InboundEvent::StateChanged { from, to }) => {
                    info!(%from, %to, "Connection state changed");
                }
                Some(InboundEvent::ConnectionFailed { reason }) => {
                    error!(%reason, "Broker connection lost for good");
                    break;
                }
                Some(InboundEvent::Unhandled { .. }) => {}
                None => break,
            },
        }
    }

    let snapshot = session.metrics().await;
    info!(
        received = snapshot.messages_received,
        reconnects = snapshot.reconnects,
        "Session summary"
    );
    session.close().await;
    Ok(())
}

async fn send(
    config: DevlinkConfig,
    device: &str,
    operation: &str,
    args: String,
    wait: Duration,
) -> CliResult {
    let session = Session::new(MqttTransport::new());
    session.connect(config.session).await?;

    let mut events = session.events();
    session
        .subscribe(&TopicBuilder::ack_topic(device), QoS::AtLeastOnce)
        .await?;

    let command = DevicePayload::invoke(operation, args.into_bytes());
    let correlation_id = command.correlation_id();
    let handle = session
        .send_command(device, &command, QoS::AtLeastOnce)
        .await?;
    let outcome = handle.outcome().await;
    if let Err(e) = outcome {
        session.close().await;
        return Err(e.into());
    }
    info!(%device, %operation, "Command delivered to broker");

    let ack = tokio::time::timeout(wait, async {
        while let Some(event) = events.next().await {
            if let InboundEvent::Message(message) = event {
                if message.correlation_id() == correlation_id {
                    return Some(message.payload);
                }
            }
        }
        None
    })
    .await;

    match ack {
        Ok(Some(payload)) => println!("{payload:?}"),
        _ => warn!(%device, "No acknowledgment from device"),
    }

    session.close().await;
    Ok(())
}

async fn fetch(config: DevlinkConfig, path: &str, method: &str) -> CliResult {
    let section = config
        .http
        .ok_or("no [http] section in the configuration")?;
    let method = HttpMethod::parse(method).ok_or_else(|| format!("unsupported method {method}"))?;

    let http = ReqwestCollaborator::new(&section)?;
    let response = http.request(method, path, None).await?;
    info!(status = response.status, bytes = response.body.len(), "HTTP response");
    println!("{}", String::from_utf8_lossy(&response.body));

    if !response.is_success() {
        return Err(format!("request failed with status {}", response.status).into());
    }
    Ok(())
}

fn handle_config_command(config: &DevlinkConfig, show: bool) -> CliResult {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    println!("Configuration is valid");
    Ok(())
}
