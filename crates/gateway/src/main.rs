//! BACnet-MQTT Gateway
//!
//! Discovers BACnet devices, polls their points, and publishes value changes
//! to an MQTT broker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bacnet_gateway::bacnet::SimulatedNetwork;
use bacnet_gateway::gateway_runtime::ServiceManager;
use bacnet_gateway::mqtt::MqttBus;
use bacnet_gateway::{Gateway, GatewayConfig};

/// BACnet to MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "bacnet-gateway")]
#[command(about = "BACnet to MQTT gateway", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bacnet_gateway=info,gateway_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting BACnet gateway v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.exists().then_some(args.config.as_path());
    if config_path.is_none() {
        info!(path = %args.config.display(), "Config file not found, using defaults");
    }
    let config = GatewayConfig::load(config_path).context("loading configuration")?;

    // No BACnet/IP stack is linked in; the configured simulated devices stand in for the field
    let field = Arc::new(SimulatedNetwork::from_config(&config.simulation.devices));
    info!(
        interface = %config.bacnet.interface,
        port = config.bacnet.port,
        devices = config.simulation.devices.len(),
        "Field network ready"
    );

    let bus = Arc::new(MqttBus::connect(&config.mqtt));
    let manager = ServiceManager::new();
    let gateway = Gateway::open(config, field, bus.clone(), manager.event_publisher())
        .await
        .context("opening gateway state")?;
    gateway.start(&manager).await.context("starting services")?;

    for (id, state) in manager.list() {
        info!("  - {} ({})", id, state);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Err(e) = manager.shutdown_all().await {
        error!("Error during shutdown: {}", e);
    }
    gateway.flush().await;
    bus.close().await;

    info!("Gateway stopped");
    Ok(())
}
