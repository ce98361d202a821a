//! MQTT engine command line client
//!
//! Connects one handle to the configured broker, subscribes to the configured
//! filters and prints every received event as a JSON line.

use clap::{Parser, Subcommand};
use mqtt_engine::config::EngineConfig;
use mqtt_engine::observability::{init_default_logging, metrics::metrics};
use mqtt_engine::protocol::qos_from_u8;
use mqtt_engine::{
    ConnectionState, HandleConfig, HandleId, MqttEngine, MqttEvent, PublishRequest, Subscription,
};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// MQTT 3.1.1 client engine
#[derive(Parser)]
#[command(name = "mqtt-engine")]
#[command(about = "Multi-handle MQTT 3.1.1 client engine")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe and print events until interrupted
    Run,
    /// Publish a single message and disconnect
    Publish {
        topic: String,
        payload: String,
        /// Delivery guarantee: 0, 1 or 2
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Validate the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting MQTT engine v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_client(config).await,
        Commands::Publish {
            topic,
            payload,
            qos,
            retain,
        } => publish_once(config, topic, payload, qos, retain).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(EngineConfig::load_from_file(path)?);
    }

    for path_str in ["mqtt-engine.toml", "config/mqtt-engine.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(EngineConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create mqtt-engine.toml".into())
}

/// Create the engine and a connected handle for `config`
async fn connect(
    config: &EngineConfig,
) -> Result<(Arc<MqttEngine>, HandleId), Box<dyn std::error::Error>> {
    let engine = Arc::new(MqttEngine::from_config(config)?);
    let id = engine.create(HandleConfig::new(
        config.client.descriptor.clone(),
        config.broker.clone(),
    ))?;
    engine.register(id, Arc::new(print_event))?;

    let outcome = engine.connect(id, config.client.connect_info()?).await?;
    info!(
        broker = %config.broker,
        client_id = %outcome.client_id,
        session_present = outcome.session_present,
        "Connected"
    );
    Ok((engine, id))
}

async fn run_client(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (engine, id) = connect(&config).await?;

    if !config.subscriptions.is_empty() {
        let subscriptions = config
            .subscriptions
            .iter()
            .map(|s| Subscription::new(s.filter.clone(), s.qos))
            .collect();
        for result in engine.subscribe(id, subscriptions).await? {
            if result.is_granted() {
                info!(filter = %result.filter, outcome = ?result.outcome, "Subscribed");
            } else {
                warn!(filter = %result.filter, "Broker rejected subscription");
            }
        }
    }

    let mut states = engine.lookup(id)?.state_changes();
    info!("Client is running; press Ctrl-C to stop");

    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received interrupt, shutting down gracefully...");
        }
        _ = states.wait_for(|state| *state == ConnectionState::Init) => {
            error!("Connection to broker lost, shutting down...");
        }
    }

    engine.shutdown().await?;
    let snapshot = metrics().get_metrics();
    info!(
        messages_received = snapshot.events.messages_received,
        packets_sent = snapshot.traffic.packets_sent,
        "Session statistics"
    );
    Ok(())
}

async fn publish_once(
    config: EngineConfig,
    topic: String,
    payload: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = qos_from_u8(qos)?;
    let (engine, id) = connect(&config).await?;

    engine
        .publish(id, PublishRequest::new(topic.clone(), payload, qos).retain(retain))
        .await?;
    info!(topic = %topic, qos = ?qos, "Published");

    engine.disconnect(id).await?;
    engine.shutdown().await?;
    Ok(())
}

fn handle_config_command(config: EngineConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn print_event(handle: HandleId, event: &MqttEvent) {
    let line = match event {
        MqttEvent::Publish(message) | MqttEvent::SubscriptionMessage(message) => json!({
            "handle": handle.to_string(),
            "event": event.kind(),
            "topic": message.topic,
            "qos": message.qos as u8,
            "retain": message.retain,
            "dup": message.dup,
            "payload": String::from_utf8_lossy(&message.payload),
            "received_at": message.received_at.to_rfc3339(),
        }),
        MqttEvent::Disconnect(disconnect) => json!({
            "handle": handle.to_string(),
            "event": event.kind(),
            "kind": disconnect.kind,
            "reason": disconnect.reason,
            "at": disconnect.at.to_rfc3339(),
        }),
    };
    println!("{line}");
}
